//! Reconciliation engine
//!
//! One call to [`ReconcileEngine::reconcile`] runs a single pass for one
//! VNF: it loads the intent, takes the per-identity pass lock, honours
//! deletion and the backoff window, runs the handler for the current phase
//! on a working copy of the state and commits that copy only when the
//! handler succeeds.

mod phases;

#[cfg(test)]
mod tests;

pub use phases::validate_spec;

use crate::allocator::{QuotaAllocator, ResourceAllocator};
use crate::analyzer::FailureAnalyzer;
use crate::dms::DmsClient;
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::generator::{KptPackageGenerator, PackageGenerator};
use crate::gitops::GitOpsClient;
use crate::models::{VnfIntent, VnfKey, VnfStatus, VNF_FINALIZER};
use crate::monitor::{HealthMonitor, MonitorConfig};
use crate::observability::{results, OperatorMetrics, StructuredLogger};
use crate::retry::BackoffPolicy;
use crate::state::{DeploymentState, Phase, StateEntry, StateSummary, VnfStateStore};
use crate::store::ObjectStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backoff: BackoffPolicy,
    /// Deadline for any single remote call (default: 60 seconds)
    pub call_timeout: Duration,
    /// Message fragments that mark an untagged internal error as recoverable
    pub retryable_errors: Vec<String>,
    /// Re-invocation delay while Running and healthy (default: 5 minutes)
    pub running_poll_interval: Duration,
    /// Delay after Deploying and Updating for the remote side to settle (default: 30 seconds)
    pub deploy_settle: Duration,
    /// Re-invocation delay after a transient status poll failure (default: 60 seconds)
    pub transient_poll_requeue: Duration,
    /// Suggested re-invocation delay after a failed pass (default: 30 seconds)
    pub error_requeue: Duration,
    /// Fail Translating when the GitOps push fails
    pub gate_deploy_on_push: bool,
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            call_timeout: Duration::from_secs(60),
            retryable_errors: vec![
                "timeout".to_string(),
                "connection".to_string(),
                "temporary".to_string(),
            ],
            running_poll_interval: Duration::from_secs(300),
            deploy_settle: Duration::from_secs(30),
            transient_poll_requeue: Duration::from_secs(60),
            error_requeue: Duration::from_secs(30),
            gate_deploy_on_push: false,
            monitor: MonitorConfig::default(),
        }
    }
}

/// Result of a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// When to run the next pass; `None` means only on external change
    pub requeue_after: Option<Duration>,
    /// Phase after the pass; `None` once the state entry is gone
    pub phase: Option<Phase>,
    /// Whether a phase handler ran (false while waiting out a backoff)
    pub handled: bool,
}

impl ReconcileOutcome {
    fn idle(phase: Option<Phase>) -> Self {
        Self {
            requeue_after: None,
            phase,
            handled: false,
        }
    }
}

/// What a handler asks the driver to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    next: Phase,
    requeue_after: Option<Duration>,
}

impl Transition {
    /// Move to `next` and run again right away
    fn advance(next: Phase) -> Self {
        Self {
            next,
            requeue_after: Some(Duration::ZERO),
        }
    }

    fn after(next: Phase, delay: Duration) -> Self {
        Self {
            next,
            requeue_after: Some(delay),
        }
    }

    /// Move to `next` and wait for an external change
    fn halt(next: Phase) -> Self {
        Self {
            next,
            requeue_after: None,
        }
    }
}

/// Everything a phase handler may touch during one pass
struct Pass<'a> {
    key: &'a VnfKey,
    intent: &'a VnfIntent,
    state: &'a mut DeploymentState,
    cancel: &'a CancellationToken,
}

/// Phase-based reconciliation of VNF deployments
pub struct ReconcileEngine {
    store: Arc<dyn ObjectStore>,
    dms: Arc<dyn DmsClient>,
    allocator: Arc<dyn ResourceAllocator>,
    generator: Arc<dyn PackageGenerator>,
    gitops: Option<Arc<dyn GitOpsClient>>,
    analyzer: FailureAnalyzer,
    states: Arc<VnfStateStore>,
    monitor: Arc<HealthMonitor>,
    config: EngineConfig,
    metrics: OperatorMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for ReconcileEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileEngine")
            .field("config", &self.config)
            .field("managed", &self.states.len())
            .finish()
    }
}

impl ReconcileEngine {
    pub fn builder() -> ReconcileEngineBuilder {
        ReconcileEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn states(&self) -> &Arc<VnfStateStore> {
        &self.states
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Current state of one VNF
    pub async fn status(&self, key: &VnfKey) -> Option<DeploymentState> {
        self.states.snapshot(key).await
    }

    /// Summaries of every tracked VNF
    pub async fn summaries(&self) -> Vec<(VnfKey, StateSummary)> {
        self.states
            .snapshots()
            .await
            .into_iter()
            .map(|(key, state)| (key, state.summary()))
            .collect()
    }

    /// Delay the caller should wait before retrying a failed pass
    pub async fn retry_delay(&self, key: &VnfKey) -> Duration {
        let now = Utc::now();
        self.states
            .snapshot(key)
            .await
            .and_then(|s| s.next_retry_at)
            .and_then(|at| (at - now).to_std().ok())
            .filter(|d| !d.is_zero())
            .unwrap_or(self.config.error_requeue)
    }

    /// Stop background work owned by the engine
    pub async fn shutdown(&self) {
        self.monitor.shutdown().await;
    }

    /// Run one reconcile pass for `key`
    pub async fn reconcile(
        &self,
        key: &VnfKey,
        cancel: &CancellationToken,
    ) -> LifecycleResult<ReconcileOutcome> {
        let started = Instant::now();
        let result = self.run_pass(key, cancel).await;

        let label = match &result {
            Ok(outcome) if !outcome.handled => results::DEFERRED,
            Ok(_) => results::SUCCESS,
            Err(LifecycleError::Cancelled) => results::CANCELLED,
            Err(_) => results::ERROR,
        };
        self.metrics
            .observe_reconcile(started.elapsed().as_secs_f64(), label);
        self.metrics.set_managed_vnfs(self.states.len() as i64);
        self.metrics
            .set_allocated_cores(self.allocator.allocated_cores() as i64);
        result
    }

    async fn run_pass(
        &self,
        key: &VnfKey,
        cancel: &CancellationToken,
    ) -> LifecycleResult<ReconcileOutcome> {
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        let (entry, created) = self.states.get_or_create(key);
        let _pass = tokio::select! {
            guard = entry.begin_pass() => guard,
            _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
        };

        // A concurrent pass terminated this identity while we waited
        if !self.states.is_current(key, &entry) {
            debug!(vnf = %key, "State entry replaced while waiting, requeueing");
            return Ok(ReconcileOutcome {
                requeue_after: Some(Duration::ZERO),
                phase: None,
                handled: false,
            });
        }

        let intent = match self.guarded(cancel, "object get", self.store.get(key)).await {
            Ok(intent) => intent,
            Err(e) if e.is_not_found() => {
                self.forget(key, &entry).await;
                return Ok(ReconcileOutcome::idle(None));
            }
            Err(e) => {
                if created {
                    self.states.remove(key);
                }
                return Err(e);
            }
        };

        if intent.metadata.deletion_requested {
            return self.terminate(key, &entry, intent, cancel).await;
        }

        let mut intent = intent;
        if !intent.metadata.has_finalizer(VNF_FINALIZER) {
            intent.metadata.finalizers.push(VNF_FINALIZER.to_string());
            self.guarded(cancel, "object update", self.store.update(&intent))
                .await?;
            debug!(vnf = %key, "Finalizer added");
        }

        let mut working = entry.snapshot().await;
        let now = Utc::now();

        if working.permanently_failed {
            if intent.metadata.generation == working.observed_generation {
                return Ok(ReconcileOutcome::idle(Some(working.phase)));
            }
            working.phase = Phase::Initializing;
            working.permanently_failed = false;
            working.retry_count = 0;
            working.failed_phase = None;
            working.next_retry_at = None;
            working.record_event(
                "SpecChanged",
                format!(
                    "Generation {} supersedes permanently failed generation {}, restarting",
                    intent.metadata.generation, working.observed_generation
                ),
            );
        }

        if let Some(at) = working.next_retry_at {
            if now < at {
                let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                debug!(vnf = %key, wait_ms = wait.as_millis() as u64, "Backoff active, deferring");
                return Ok(ReconcileOutcome {
                    requeue_after: Some(wait),
                    phase: Some(working.phase),
                    handled: false,
                });
            }
        }

        let from = working.phase;
        let base = working.clone();
        let handler_started = Instant::now();
        let result = {
            let mut pass = Pass {
                key,
                intent: &intent,
                state: &mut working,
                cancel,
            };
            self.dispatch(&mut pass).await
        };
        let elapsed_ms = handler_started.elapsed().as_millis() as u64;

        match result {
            Ok(transition) => {
                self.advance(key, &mut working, from, transition, elapsed_ms);
                let status = self.status_for(&working, None);
                let phase = working.phase;
                commit(&entry, working).await;
                self.write_status(key, status, cancel).await?;

                Ok(ReconcileOutcome {
                    requeue_after: transition.requeue_after,
                    phase: Some(phase),
                    handled: true,
                })
            }
            Err(LifecycleError::Cancelled) => Err(LifecycleError::Cancelled),
            Err(error) => {
                let recoverable = self.is_recoverable(&error);
                let mut failed = base;
                failed.record_failure(&error, recoverable);
                failed.metrics.observe_pass(elapsed_ms, true);

                self.metrics.inc_phase_failure(from.as_str());
                self.logger.log_phase_failed(
                    &key.to_string(),
                    from.as_str(),
                    error.code(),
                    recoverable,
                    &error.to_string(),
                );

                let status = self.status_for(&failed, Some(error.to_string()));
                commit(&entry, failed).await;
                if let Err(e) = self.write_status(key, status, cancel).await {
                    warn!(vnf = %key, error = %e, "Failed to record failure status");
                }
                Err(error)
            }
        }
    }

    /// Exhaustive phase dispatch
    async fn dispatch(&self, pass: &mut Pass<'_>) -> LifecycleResult<Transition> {
        match pass.state.phase {
            Phase::Initializing => self.initialize(pass).await,
            Phase::Validating => self.validate(pass).await,
            Phase::Translating => self.translate(pass).await,
            Phase::Allocating => self.allocate(pass).await,
            Phase::Deploying => self.deploy(pass).await,
            Phase::Running => self.run(pass).await,
            Phase::Updating => self.update(pass).await,
            Phase::Failed => self.recover(pass).await,
            // Only reachable through deletion, which is handled before dispatch
            Phase::Terminating | Phase::Terminated => Ok(Transition::halt(pass.state.phase)),
        }
    }

    /// Apply a successful transition to the working state
    fn advance(
        &self,
        key: &VnfKey,
        state: &mut DeploymentState,
        from: Phase,
        transition: Transition,
        elapsed_ms: u64,
    ) {
        let to = transition.next;
        let now = Utc::now();

        if to != from {
            state.phase = to;
            state.record_event("PhaseTransition", format!("{} -> {}", from, to));
            self.logger
                .log_phase_transition(&key.to_string(), from.as_str(), to.as_str());
        }

        // The phase that failed last has now succeeded
        if from != Phase::Failed && state.failed_phase == Some(from) && to != from {
            state.retry_count = 0;
            state.failed_phase = None;
        }

        if to == Phase::Running && from != Phase::Running {
            state.retry_count = 0;
            state.failed_phase = None;
            if let Some(started) = state.cycle_started_at.take() {
                state.metrics.deployment_time_ms =
                    Some((now - started).num_milliseconds().max(0) as u64);
            }
        }

        state.metrics.observe_pass(elapsed_ms, false);
        state.last_update = now;
    }

    fn is_recoverable(&self, error: &LifecycleError) -> bool {
        let kind = error.kind();
        if kind.is_retryable() {
            return true;
        }
        if kind == ErrorKind::Internal {
            let message = error.to_string().to_lowercase();
            return self
                .config
                .retryable_errors
                .iter()
                .any(|fragment| message.contains(&fragment.to_lowercase()));
        }
        false
    }

    fn status_for(&self, state: &DeploymentState, message: Option<String>) -> VnfStatus {
        let message = message.or_else(|| {
            if state.permanently_failed {
                Some(format!(
                    "permanently failed after {} retries: {}",
                    state.retry_count,
                    state.last_error_message().unwrap_or_default()
                ))
            } else if state.phase == Phase::Failed {
                state.last_error_message()
            } else {
                None
            }
        });

        VnfStatus {
            phase: state.phase.as_str().to_string(),
            observed_generation: state.observed_generation,
            remote_deployment_id: state.remote_deployment_id.clone(),
            last_reconcile_time: Some(Utc::now()),
            deployed_sites: state
                .resources
                .as_ref()
                .map(|r| r.sites.clone())
                .unwrap_or_default(),
            message,
            retry_count: state.retry_count,
            permanent_failure: state.permanently_failed,
            next_retry_at: state.next_retry_at,
        }
    }

    async fn write_status(
        &self,
        key: &VnfKey,
        status: VnfStatus,
        cancel: &CancellationToken,
    ) -> LifecycleResult<()> {
        match self
            .guarded(cancel, "status update", self.store.update_status(key, status))
            .await
        {
            Ok(()) => Ok(()),
            // Deleted mid-pass; the next pass cleans up
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(vnf = %key, error = %e, "Status update failed");
                Err(e)
            }
        }
    }

    /// Run a remote call under the configured deadline and the caller's cancellation
    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        call: impl Future<Output = LifecycleResult<T>>,
    ) -> LifecycleResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LifecycleError::Cancelled),
            result = tokio::time::timeout(self.config.call_timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(LifecycleError::Timeout(format!(
                    "{} exceeded {:?}",
                    operation, self.config.call_timeout
                ))),
            },
        }
    }

    /// Drop state for an intent that no longer exists
    async fn forget(&self, key: &VnfKey, entry: &Arc<StateEntry>) {
        let state = entry.snapshot().await;
        self.monitor.stop(key).await;
        if let Some(envelope) = &state.resources {
            if let Err(e) = self.allocator.release(envelope).await {
                warn!(vnf = %key, error = %e, "Failed to release resources of vanished VNF");
            }
        }
        self.states.remove(key);
        debug!(vnf = %key, "Intent gone, state dropped");
    }
}

/// Replace the committed state with `working`, keeping health written by
/// the monitor after the pass took its snapshot
async fn commit(entry: &StateEntry, mut working: DeploymentState) {
    entry
        .update(move |current| {
            let monitor_newer = match (current.health.last_check, working.health.last_check) {
                (Some(committed), Some(ours)) => committed > ours,
                (Some(_), None) => true,
                _ => false,
            };
            if monitor_newer {
                working.health = current.health.clone();
                working.metrics.resource_utilization = current.metrics.resource_utilization.clone();
                working.metrics.qos = current.metrics.qos.clone();
            }
            *current = working;
        })
        .await;
}

/// Builder for [`ReconcileEngine`]
#[derive(Default)]
pub struct ReconcileEngineBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    dms: Option<Arc<dyn DmsClient>>,
    allocator: Option<Arc<dyn ResourceAllocator>>,
    generator: Option<Arc<dyn PackageGenerator>>,
    gitops: Option<Arc<dyn GitOpsClient>>,
    analyzer: Option<FailureAnalyzer>,
    states: Option<Arc<VnfStateStore>>,
    config: Option<EngineConfig>,
    logger: Option<StructuredLogger>,
}

impl ReconcileEngineBuilder {
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn dms(mut self, dms: Arc<dyn DmsClient>) -> Self {
        self.dms = Some(dms);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn ResourceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn PackageGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn gitops(mut self, gitops: Arc<dyn GitOpsClient>) -> Self {
        self.gitops = Some(gitops);
        self
    }

    pub fn analyzer(mut self, analyzer: FailureAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn states(mut self, states: Arc<VnfStateStore>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> LifecycleResult<ReconcileEngine> {
        let store = self
            .store
            .ok_or_else(|| LifecycleError::internal("object store is required"))?;
        let dms = self
            .dms
            .ok_or_else(|| LifecycleError::internal("DMS client is required"))?;
        let config = self.config.unwrap_or_default();
        let states = self.states.unwrap_or_default();
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&dms),
            Arc::clone(&states),
            config.monitor.clone(),
        ));

        Ok(ReconcileEngine {
            store,
            dms,
            allocator: self
                .allocator
                .unwrap_or_else(|| Arc::new(QuotaAllocator::unbounded())),
            generator: self
                .generator
                .unwrap_or_else(|| Arc::new(KptPackageGenerator::new())),
            gitops: self.gitops,
            analyzer: self.analyzer.unwrap_or_default(),
            states,
            monitor,
            config,
            metrics: OperatorMetrics::new(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("vnf-operator")),
        })
    }
}
