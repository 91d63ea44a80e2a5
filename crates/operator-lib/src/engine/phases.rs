//! Per-phase handlers
//!
//! Each handler mutates the pass's working state and returns the
//! transition to apply. Returning an error leaves the committed state
//! untouched apart from the failure record.

use super::{Pass, ReconcileEngine, ReconcileOutcome, Transition};
use crate::allocator::AllocationRequest;
use crate::analyzer::{FailureAnalysis, RemediationKind};
use crate::dms::RemoteState;
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::models::{VnfIntent, VnfKey, VnfSpec, VnfStatus, VNF_FINALIZER};
use crate::monitor::HealthMonitor;
use crate::state::{DeploymentMetrics, Phase, StateEntry};
use chrono::Utc;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Structural checks on a spec, in the order they are reported
pub fn validate_spec(spec: &VnfSpec) -> LifecycleResult<()> {
    if spec.vnf_type.is_none() {
        return Err(LifecycleError::validation("VNF type is required"));
    }
    if spec.version.trim().is_empty() {
        return Err(LifecycleError::validation("VNF version is required"));
    }
    if spec.image.repository.trim().is_empty() {
        return Err(LifecycleError::validation("image repository is required"));
    }
    if spec.image.tag.trim().is_empty() {
        return Err(LifecycleError::validation("image tag is required"));
    }
    if spec.resources.cpu_cores == 0 {
        return Err(LifecycleError::validation("CPU cores must be greater than 0"));
    }
    if spec.resources.memory_gb == 0 {
        return Err(LifecycleError::validation("memory must be greater than 0"));
    }
    if spec.target_sites.is_empty() {
        return Err(LifecycleError::validation(
            "at least one target site is required",
        ));
    }
    if spec.target_sites.iter().any(|s| s.trim().is_empty()) {
        return Err(LifecycleError::validation("target site names must not be empty"));
    }
    let qos = &spec.qos;
    for (name, value) in [
        ("bandwidth", qos.bandwidth_mbps),
        ("latency", qos.latency_ms),
        ("jitter", qos.jitter_ms),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(LifecycleError::validation(format!(
                "QoS {} must be a non-negative number",
                name
            )));
        }
    }
    Ok(())
}

impl ReconcileEngine {
    pub(super) async fn initialize(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        let state = &mut *pass.state;

        if let Some(envelope) = state.resources.take() {
            self.allocator.release(&envelope).await?;
            state.record_event("ResourcesReleased", "Released envelope from previous cycle");
        }

        // Adopt a deployment recorded before a restart rather than creating a duplicate
        if state.remote_deployment_id.is_empty()
            && !pass.intent.status.remote_deployment_id.is_empty()
        {
            state.remote_deployment_id = pass.intent.status.remote_deployment_id.clone();
        }

        state.spec = Some(pass.intent.spec.clone());
        state.observed_generation = pass.intent.metadata.generation;
        state.metrics = DeploymentMetrics::default();
        state.artifacts.clear();
        state.gitops_revision = None;
        state.cycle_started_at = Some(Utc::now());

        let status = VnfStatus {
            phase: Phase::Initializing.as_str().to_string(),
            observed_generation: state.observed_generation,
            remote_deployment_id: state.remote_deployment_id.clone(),
            last_reconcile_time: Some(Utc::now()),
            ..Default::default()
        };
        self.guarded(
            pass.cancel,
            "status update",
            self.store.update_status(pass.key, status),
        )
        .await?;

        Ok(Transition::advance(Phase::Validating))
    }

    pub(super) async fn validate(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        validate_spec(&pass.intent.spec)?;
        pass.state.record_event("Validated", "Spec passed validation");
        Ok(Transition::advance(Phase::Translating))
    }

    pub(super) async fn translate(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        let artifacts = self
            .guarded(pass.cancel, "package generation", self.generator.generate(pass.intent))
            .await?;
        self.guarded(
            pass.cancel,
            "package validation",
            self.generator.validate(&artifacts),
        )
        .await?;

        let state = &mut *pass.state;
        state.artifacts = artifacts.ids();

        let mut metadata = BTreeMap::new();
        metadata.insert("package".to_string(), artifacts.package_name.clone());
        metadata.insert("digest".to_string(), artifacts.digest());
        metadata.insert("artifacts".to_string(), artifacts.artifacts.len().to_string());
        state.record_event_with(
            "PackageGenerated",
            format!("Generated package {}", artifacts.package_name),
            metadata,
        );

        if let Some(gitops) = &self.gitops {
            match self
                .guarded(pass.cancel, "gitops push", gitops.push(&artifacts))
                .await
            {
                Ok(revision) => {
                    state.record_event("PackagePushed", format!("Pushed revision {}", revision));
                    state.gitops_revision = Some(revision);
                }
                Err(LifecycleError::Cancelled) => return Err(LifecycleError::Cancelled),
                Err(e) if self.config.gate_deploy_on_push => return Err(e),
                Err(e) => {
                    warn!(vnf = %pass.key, error = %e, "GitOps push failed, continuing");
                    state.record_event("PackagePushFailed", e.to_string());
                }
            }
        }

        Ok(Transition::advance(Phase::Allocating))
    }

    pub(super) async fn allocate(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        let state = &mut *pass.state;

        if let Some(previous) = state.resources.take() {
            self.allocator.release(&previous).await?;
        }

        let request = AllocationRequest::from_spec(&pass.intent.spec);
        let envelope = self.allocator.allocate(&request).await?;

        state.record_event(
            "ResourcesAllocated",
            format!(
                "{} cores, {} GB memory, {} GB storage on {}",
                envelope.cpu_cores,
                envelope.memory_gb,
                envelope.storage_gb,
                envelope.sites.join(",")
            ),
        );
        state.resources = Some(envelope);

        Ok(Transition::advance(Phase::Deploying))
    }

    pub(super) async fn deploy(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        let existing = pass.state.remote_deployment_id.clone();

        let deployment_id = if existing.is_empty() {
            self.create_remote(pass).await?
        } else {
            match self
                .guarded(
                    pass.cancel,
                    "dms update",
                    self.dms.update_deployment(&existing, pass.intent),
                )
                .await
            {
                Ok(()) => {
                    pass.state.record_event(
                        "DeploymentConverged",
                        format!("Existing deployment {} updated", existing),
                    );
                    existing
                }
                Err(e) if e.is_not_found() => {
                    pass.state.remote_deployment_id.clear();
                    self.create_remote(pass).await?
                }
                Err(e) => return Err(e),
            }
        };

        pass.state.remote_deployment_id = deployment_id.clone();
        self.monitor.ensure_running(pass.key, &deployment_id);
        self.metrics
            .set_active_monitors(self.monitor.active_count() as i64);

        Ok(Transition::after(Phase::Running, self.config.deploy_settle))
    }

    async fn create_remote(&self, pass: &mut Pass<'_>) -> LifecycleResult<String> {
        match self
            .guarded(pass.cancel, "dms create", self.dms.create_deployment(pass.intent))
            .await
        {
            Ok(id) => {
                pass.state
                    .record_event("DeploymentCreated", format!("Remote deployment {}", id));
                Ok(id)
            }
            Err(LifecycleError::AlreadyExists {
                existing_id: Some(id),
                ..
            }) => {
                pass.state.record_event(
                    "DeploymentAdopted",
                    format!("Remote deployment {} already existed", id),
                );
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    pub(super) async fn run(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        if pass.intent.metadata.generation != pass.state.observed_generation {
            pass.state.record_event(
                "SpecChanged",
                format!(
                    "Generation {} observed, was {}",
                    pass.intent.metadata.generation, pass.state.observed_generation
                ),
            );
            return Ok(Transition::advance(Phase::Updating));
        }

        let deployment_id = pass.state.remote_deployment_id.clone();
        if deployment_id.is_empty() {
            return Err(LifecycleError::NotFound(format!(
                "remote deployment for {}",
                pass.key
            )));
        }
        self.monitor.ensure_running(pass.key, &deployment_id);

        let status = match self
            .guarded(
                pass.cancel,
                "dms status",
                self.dms.get_deployment_status(&deployment_id),
            )
            .await
        {
            Ok(status) => status,
            Err(LifecycleError::Cancelled) => return Err(LifecycleError::Cancelled),
            Err(e) if e.kind() == ErrorKind::TransientRemote => {
                debug!(vnf = %pass.key, error = %e, "Status poll failed, will poll again");
                HealthMonitor::apply_error(pass.state, &e);
                return Ok(Transition::after(
                    Phase::Running,
                    self.config.transient_poll_requeue,
                ));
            }
            Err(e) => return Err(e),
        };

        HealthMonitor::apply_status(pass.state, &status);

        match status.state {
            RemoteState::Running => Ok(Transition::after(
                Phase::Running,
                self.config.running_poll_interval,
            )),
            RemoteState::Failed => Err(LifecycleError::RemoteFailed(
                status
                    .message
                    .unwrap_or_else(|| format!("deployment {} reported Failed", deployment_id)),
            )),
            RemoteState::Updating => Ok(Transition::advance(Phase::Updating)),
            RemoteState::Creating | RemoteState::Deleting | RemoteState::Unknown => Ok(
                Transition::after(Phase::Running, self.config.deploy_settle),
            ),
        }
    }

    /// Updating: push the new generation to the DMS, then resize the envelope
    ///
    /// Reservations only change once the DMS has accepted the update, so a
    /// rejected or cancelled update leaves the previous envelope held.
    pub(super) async fn update(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        validate_spec(&pass.intent.spec)?;

        let deployment_id = pass.state.remote_deployment_id.clone();
        if deployment_id.is_empty() {
            return Err(LifecycleError::NotFound(format!(
                "remote deployment for {}",
                pass.key
            )));
        }

        self.guarded(
            pass.cancel,
            "dms update",
            self.dms.update_deployment(&deployment_id, pass.intent),
        )
        .await?;

        let wanted = AllocationRequest::from_spec(&pass.intent.spec);
        let held = pass.state.spec.as_ref().map(AllocationRequest::from_spec);
        if held.as_ref() != Some(&wanted) || pass.state.resources.is_none() {
            if let Some(previous) = pass.state.resources.take() {
                self.allocator.release(&previous).await?;
            }
            let envelope = self.allocator.allocate(&wanted).await?;
            pass.state.record_event(
                "ResourcesReallocated",
                format!("{} cores on {}", envelope.cpu_cores, envelope.sites.join(",")),
            );
            pass.state.resources = Some(envelope);
        }

        let state = &mut *pass.state;
        state.spec = Some(pass.intent.spec.clone());
        state.observed_generation = pass.intent.metadata.generation;
        state.record_event(
            "DeploymentUpdated",
            format!("Generation {} sent to {}", state.observed_generation, deployment_id),
        );

        Ok(Transition::after(Phase::Running, self.config.deploy_settle))
    }

    /// Failed: analyse, then either give up, remediate or schedule a retry
    pub(super) async fn recover(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        // A retry scheduled by an earlier pass is now due
        if pass.state.next_retry_at.take().is_some() {
            pass.state.record_event(
                "RetryStarted",
                format!("Retry {} of {}", pass.state.retry_count, self.config.backoff.max_retries),
            );
            return Ok(Transition::advance(Phase::Validating));
        }

        let analysis = self.analyzer.analyze(&pass.state.error_history);
        let mut metadata = BTreeMap::new();
        metadata.insert("root_cause".to_string(), analysis.root_cause.clone());
        metadata.insert("confidence".to_string(), format!("{:.2}", analysis.confidence));
        if let Some(pattern) = &analysis.pattern {
            metadata.insert("pattern".to_string(), pattern.clone());
        }
        pass.state
            .record_event_with("FailureAnalyzed", analysis.root_cause.clone(), metadata);

        // A bad intent waits for a new generation instead of retrying
        let invalid_intent = pass
            .state
            .error_history
            .last()
            .map(|e| e.kind == ErrorKind::Validation)
            .unwrap_or(false);

        if invalid_intent || self.config.backoff.exhausted(pass.state.retry_count) {
            let state = &mut *pass.state;
            state.permanently_failed = true;
            state.next_retry_at = None;
            let reason = if invalid_intent {
                // Only a newer generation than the rejected one restarts the VNF
                state.observed_generation = pass.intent.metadata.generation;
                format!("Waiting for a spec change: {}", analysis.root_cause)
            } else {
                format!(
                    "Giving up after {} retries: {}",
                    state.retry_count, analysis.root_cause
                )
            };
            state.record_event("PermanentFailure", reason);
            self.metrics.inc_permanent_failures();
            self.logger.log_permanent_failure(
                &pass.key.to_string(),
                state.retry_count,
                &analysis.root_cause,
            );
            return Ok(Transition::halt(Phase::Failed));
        }

        let remediated = analysis.has_auto_remediation() && self.remediate(pass, &analysis).await;
        pass.state.retry_count += 1;

        if remediated {
            pass.state
                .record_event("RemediationSucceeded", "Restarting from validation");
            return Ok(Transition::advance(Phase::Validating));
        }

        let delay = self.config.backoff.delay(pass.state.retry_count - 1);
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        pass.state.next_retry_at = Some(at);
        pass.state.record_event(
            "RetryScheduled",
            format!("Retry {} in {:?}", pass.state.retry_count, delay),
        );
        Ok(Transition::after(Phase::Failed, delay))
    }

    /// Execute every automatic action; true only if all of them succeeded
    async fn remediate(&self, pass: &mut Pass<'_>, analysis: &FailureAnalysis) -> bool {
        let vnf = pass.key.to_string();
        let mut all_ok = true;

        for action in analysis.auto_remediation.iter().filter(|a| a.auto_execute) {
            let ok = match action.kind {
                RemediationKind::RetryPipeline => true,
                RemediationKind::ReleaseResources => match pass.state.resources.take() {
                    Some(envelope) => match self.allocator.release(&envelope).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(vnf = %vnf, error = %e, "Release remediation failed");
                            pass.state.resources = Some(envelope);
                            false
                        }
                    },
                    None => true,
                },
                RemediationKind::RecreateDeployment => {
                    let id = pass.state.remote_deployment_id.clone();
                    let deleted = if id.is_empty() {
                        Ok(())
                    } else {
                        match self
                            .guarded(pass.cancel, "dms delete", self.dms.delete_deployment(&id))
                            .await
                        {
                            Err(e) if e.is_not_found() => Ok(()),
                            other => other,
                        }
                    };
                    match deleted {
                        Ok(()) => {
                            self.monitor.stop(pass.key).await;
                            pass.state.remote_deployment_id.clear();
                            true
                        }
                        Err(e) => {
                            warn!(vnf = %vnf, error = %e, "Recreate remediation failed");
                            false
                        }
                    }
                }
            };

            let action_name = action.kind.to_string();
            self.metrics.inc_remediation(&action_name, ok);
            self.logger.log_remediation(&vnf, &action_name, ok);
            pass.state.record_event(
                "Remediation",
                format!("{}: {}", action.description, if ok { "ok" } else { "failed" }),
            );
            all_ok &= ok;
        }

        all_ok
    }

    /// Tear down everything owned by a VNF whose deletion was requested
    pub(super) async fn terminate(
        &self,
        key: &VnfKey,
        entry: &StateEntry,
        mut intent: VnfIntent,
        cancel: &CancellationToken,
    ) -> LifecycleResult<ReconcileOutcome> {
        let mut state = entry.snapshot().await;
        let from = state.phase;
        if from != Phase::Terminating {
            state.phase = Phase::Terminating;
            state.record_event("PhaseTransition", format!("{} -> {}", from, Phase::Terminating));
            self.logger
                .log_phase_transition(&key.to_string(), from.as_str(), Phase::Terminating.as_str());
        }
        let status = self.status_for(&state, Some("Deletion requested".to_string()));
        entry.commit(state.clone()).await;
        self.write_status(key, status, cancel).await?;

        let deployment_id = if state.remote_deployment_id.is_empty() {
            intent.status.remote_deployment_id.clone()
        } else {
            state.remote_deployment_id.clone()
        };

        let mut remote_deleted = false;
        if !deployment_id.is_empty() {
            match self
                .guarded(cancel, "dms delete", self.dms.delete_deployment(&deployment_id))
                .await
            {
                Ok(()) => remote_deleted = true,
                Err(e) if e.is_not_found() => remote_deleted = true,
                Err(LifecycleError::Cancelled) => return Err(LifecycleError::Cancelled),
                Err(e) => {
                    warn!(vnf = %key, deployment_id = %deployment_id, error = %e, "Remote delete failed, continuing");
                }
            }
        }

        self.monitor.stop(key).await;
        self.metrics
            .set_active_monitors(self.monitor.active_count() as i64);

        if let Some(envelope) = state.resources.take() {
            if let Err(e) = self.allocator.release(&envelope).await {
                warn!(vnf = %key, error = %e, "Resource release failed during termination");
            }
        }

        self.states.remove(key);

        let before = intent.metadata.finalizers.len();
        intent.metadata.finalizers.retain(|f| f != VNF_FINALIZER);
        if intent.metadata.finalizers.len() != before {
            match self
                .guarded(cancel, "object update", self.store.update(&intent))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.logger
            .log_terminated(&key.to_string(), remote_deleted);
        info!(vnf = %key, from = %from, "Termination complete");

        Ok(ReconcileOutcome {
            requeue_after: None,
            phase: Some(Phase::Terminated),
            handled: true,
        })
    }
}
