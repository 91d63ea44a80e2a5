//! Per-VNF health monitoring
//!
//! One supervised task per deployed VNF polls the DMS and writes the
//! result into the VNF's health and metrics. Tasks never touch the phase.
//! They are tracked in a table keyed by VNF identity so they can be
//! cancelled and joined on termination or shutdown.

use crate::dms::{DmsClient, RemoteDeploymentStatus, RemoteState};
use crate::error::{LifecycleError, LifecycleResult};
use crate::models::VnfKey;
use crate::observability::OperatorMetrics;
use crate::state::{DeploymentState, HealthState, VnfStateStore};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between checks (default: 30 seconds)
    pub interval: Duration,
    /// Deadline for one DMS status call (default: 10 seconds)
    pub check_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
        }
    }
}

struct MonitorTask {
    deployment_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervised table of health check tasks
pub struct HealthMonitor {
    dms: Arc<dyn DmsClient>,
    states: Arc<VnfStateStore>,
    config: MonitorConfig,
    tasks: DashMap<VnfKey, MonitorTask>,
    shutdown: CancellationToken,
    metrics: OperatorMetrics,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(dms: Arc<dyn DmsClient>, states: Arc<VnfStateStore>, config: MonitorConfig) -> Self {
        Self {
            dms,
            states,
            config,
            tasks: DashMap::new(),
            shutdown: CancellationToken::new(),
            metrics: OperatorMetrics::new(),
        }
    }

    /// Make sure a task is polling `deployment_id` for `key`
    ///
    /// A live task for the same deployment is left alone; a finished task or
    /// one watching another deployment is replaced. Returns whether a new
    /// task was spawned.
    pub fn ensure_running(&self, key: &VnfKey, deployment_id: &str) -> bool {
        if self.shutdown.is_cancelled() || deployment_id.is_empty() {
            return false;
        }

        if let Some(existing) = self.tasks.get(key) {
            if existing.deployment_id == deployment_id && !existing.handle.is_finished() {
                return false;
            }
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_monitor(
            key.clone(),
            deployment_id.to_string(),
            Arc::clone(&self.dms),
            Arc::clone(&self.states),
            self.config.clone(),
            cancel.clone(),
        ));

        let previous = self.tasks.insert(
            key.clone(),
            MonitorTask {
                deployment_id: deployment_id.to_string(),
                cancel,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!(vnf = %key, deployment_id, "Health monitor started");
        self.metrics.set_active_monitors(self.active_count() as i64);
        true
    }

    /// Cancel and join the task for `key`, if any
    pub async fn stop(&self, key: &VnfKey) -> bool {
        let Some((_, task)) = self.tasks.remove(key) else {
            return false;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            if e.is_panic() {
                warn!(vnf = %key, "Health monitor task panicked");
            }
        }

        debug!(vnf = %key, "Health monitor stopped");
        self.metrics.set_active_monitors(self.active_count() as i64);
        true
    }

    /// Run one check now and record it
    pub async fn check_once(&self, key: &VnfKey) -> LifecycleResult<HealthState> {
        let deployment_id = self
            .states
            .snapshot(key)
            .await
            .map(|s| s.remote_deployment_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| LifecycleError::NotFound(format!("deployment for {}", key)))?;

        check(
            key,
            &deployment_id,
            self.dms.as_ref(),
            &self.states,
            self.config.check_timeout,
        )
        .await
    }

    pub fn is_monitoring(&self, key: &VnfKey) -> bool {
        self.tasks
            .get(key)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of tasks still running
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.value().handle.is_finished())
            .count()
    }

    /// Cancel every task and wait for all of them
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let keys: Vec<VnfKey> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for key in keys {
            self.stop(&key).await;
        }
        info!("Health monitors stopped");
    }

    /// Fold a DMS status into a VNF's health and rolling metrics
    pub fn apply_status(state: &mut DeploymentState, status: &RemoteDeploymentStatus) {
        let mut overall = health_of(status.state);
        let mut per_component = std::collections::BTreeMap::new();
        per_component.insert("deployment".to_string(), overall);
        for (site, site_state) in &status.sites {
            let site_health = health_of(*site_state);
            overall = worst(overall, site_health);
            per_component.insert(format!("site/{}", site), site_health);
        }

        state.health.overall = overall;
        state.health.per_component = per_component;
        state.health.last_check = Some(Utc::now());
        if let Some(message) = &status.message {
            if overall != HealthState::Healthy {
                state.health.push_error(message.clone());
            }
        }

        if !status.utilization.is_empty() {
            state.metrics.resource_utilization = status.utilization.clone();
        }
        if !status.qos.is_empty() {
            state.metrics.qos = status.qos.clone();
        }
    }

    /// Record a failed check
    pub fn apply_error(state: &mut DeploymentState, error: &LifecycleError) {
        state.health.overall = if error.is_not_found() {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };
        state.health.last_check = Some(Utc::now());
        state.health.push_error(error.to_string());
    }
}

async fn run_monitor(
    key: VnfKey,
    deployment_id: String,
    dms: Arc<dyn DmsClient>,
    states: Arc<VnfStateStore>,
    config: MonitorConfig,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the deploying pass has just checked
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if states.get(&key).is_none() {
                    debug!(vnf = %key, "State gone, health monitor exiting");
                    break;
                }
                if let Err(e) = check(&key, &deployment_id, dms.as_ref(), &states, config.check_timeout).await {
                    debug!(vnf = %key, error = %e, "Health check failed");
                }
            }
        }
    }
}

async fn check(
    key: &VnfKey,
    deployment_id: &str,
    dms: &dyn DmsClient,
    states: &VnfStateStore,
    timeout: Duration,
) -> LifecycleResult<HealthState> {
    let result = match tokio::time::timeout(timeout, dms.get_deployment_status(deployment_id)).await {
        Ok(result) => result,
        Err(_) => Err(LifecycleError::Timeout(format!(
            "health check for {} exceeded {:?}",
            deployment_id, timeout
        ))),
    };

    match result {
        Ok(status) => {
            let overall = states
                .update(key, |state| {
                    HealthMonitor::apply_status(state, &status);
                    state.health.overall
                })
                .await
                .unwrap_or(HealthState::Unknown);
            Ok(overall)
        }
        Err(e) => {
            states
                .update(key, |state| HealthMonitor::apply_error(state, &e))
                .await;
            Err(e)
        }
    }
}

fn health_of(state: RemoteState) -> HealthState {
    match state {
        RemoteState::Running => HealthState::Healthy,
        RemoteState::Creating | RemoteState::Updating | RemoteState::Deleting => {
            HealthState::Degraded
        }
        RemoteState::Failed => HealthState::Unhealthy,
        RemoteState::Unknown => HealthState::Unknown,
    }
}

fn severity_rank(state: HealthState) -> u8 {
    match state {
        HealthState::Healthy => 0,
        HealthState::Unknown => 1,
        HealthState::Degraded => 2,
        HealthState::Unhealthy => 3,
    }
}

fn worst(a: HealthState, b: HealthState) -> HealthState {
    if severity_rank(b) > severity_rank(a) {
        b
    } else {
        a
    }
}
