//! Controller loop driving the reconcile engine
//!
//! Change notifications and periodic resyncs feed a work queue that holds
//! each VNF identity at most once. A bounded number of workers take keys
//! from the queue; a key that is being reconciled is never handed out
//! twice, and triggers that arrive meanwhile collapse into one follow-up
//! pass.
//!
//! The controller also reports operator health: readiness after the first
//! successful listing, the object store by listing results, and the DMS
//! and engine by runs of transient and internal pass failures.

use crate::engine::ReconcileEngine;
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::health::{components, HealthRegistry};
use crate::models::VnfKey;
use crate::state::Phase;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Passes allowed to run at the same time (default: 10)
    pub max_concurrent_reconciles: usize,
    /// Interval between full relists of the object store (default: 60 seconds)
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 10,
            resync_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<VnfKey>,
    queued: HashSet<VnfKey>,
    active: HashSet<VnfKey>,
    /// Triggered while active; requeued when the pass finishes
    dirty: HashSet<VnfKey>,
    /// Earliest pending delayed add per key
    scheduled: HashMap<VnfKey, Instant>,
}

/// Deduplicating work queue
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: VnfKey) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed
    ///
    /// Only the earliest outstanding delay per key is kept.
    pub fn add_after(self: &Arc<Self>, key: VnfKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match state.scheduled.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.scheduled.insert(key.clone(), deadline);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = match queue.state.lock() {
                Ok(mut state) => {
                    if state.scheduled.get(&key) == Some(&deadline) {
                        state.scheduled.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            };
            if fire {
                queue.add(key);
            }
        });
    }

    fn try_take(&self) -> Option<VnfKey> {
        let mut state = self.state.lock().ok()?;
        let key = state.pending.pop_front()?;
        state.queued.remove(&key);
        state.active.insert(key.clone());
        Some(key)
    }

    /// Wait for the next key and mark it active
    pub async fn next(&self) -> VnfKey {
        loop {
            if let Some(key) = self.try_take() {
                return key;
            }
            self.notify.notified().await;
        }
    }

    /// Mark `key` finished, requeueing it if it was triggered meanwhile
    pub fn done(&self, key: &VnfKey) {
        let requeue = match self.state.lock() {
            Ok(mut state) => {
                state.active.remove(key);
                state.dirty.remove(key)
            }
            Err(_) => false,
        };
        if requeue {
            self.add(key.clone());
        }
    }

    /// Keys waiting to be taken
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drives reconcile passes for every VNF in the object store
pub struct Controller {
    engine: Arc<ReconcileEngine>,
    queue: Arc<WorkQueue>,
    health: HealthRegistry,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(engine: Arc<ReconcileEngine>, config: ControllerConfig) -> Self {
        Self {
            engine,
            queue: Arc::new(WorkQueue::new()),
            health: HealthRegistry::for_operator(),
            config,
        }
    }

    /// Report into a shared registry instead of a private one
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Queue every VNF currently in the object store
    pub async fn resync(&self) -> LifecycleResult<usize> {
        resync(&self.engine, &self.queue, &self.health).await
    }

    /// Run until `shutdown` is cancelled
    ///
    /// In-flight passes are cancelled and awaited, then the engine's
    /// health monitors are stopped.
    pub async fn run(
        &self,
        changes: broadcast::Receiver<VnfKey>,
        shutdown: CancellationToken,
    ) -> LifecycleResult<()> {
        let workers = self.config.max_concurrent_reconciles.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let passes = shutdown.child_token();

        if let Err(e) = self.resync().await {
            warn!(error = %e, "Initial listing failed, relying on change notifications");
        }

        self.health.set_healthy(components::CONTROLLER);
        let feeder = tokio::spawn(feed(
            Arc::clone(&self.engine),
            Arc::clone(&self.queue),
            self.health.clone(),
            changes,
            self.config.resync_interval,
            shutdown.clone(),
        ));

        info!(workers, "Controller started");

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
                _ = shutdown.cancelled() => break,
            };
            let Ok(permit) = permit else { break };
            let key = tokio::select! {
                key = self.queue.next() => key,
                _ = shutdown.cancelled() => break,
            };

            let engine = Arc::clone(&self.engine);
            let queue = Arc::clone(&self.queue);
            let health = self.health.clone();
            let cancel = passes.clone();
            tokio::spawn(async move {
                process(&engine, &queue, &health, key, &cancel).await;
                drop(permit);
            });
        }

        info!("Controller stopping, waiting for in-flight passes");
        passes.cancel();
        if semaphore.acquire_many(workers as u32).await.is_err() {
            warn!("Worker semaphore closed before drain");
        }
        if let Err(e) = feeder.await {
            warn!(error = %e, "Change feed task failed");
        }
        self.engine.shutdown().await;
        self.health.set_ready(false);
        self.health.set_unhealthy(components::CONTROLLER, "stopped");
        info!("Controller stopped");
        Ok(())
    }
}

async fn resync(
    engine: &ReconcileEngine,
    queue: &WorkQueue,
    health: &HealthRegistry,
) -> LifecycleResult<usize> {
    let keys = match engine.store().list().await {
        Ok(keys) => keys,
        Err(e) => {
            health.set_unhealthy(components::OBJECT_STORE, format!("listing failed: {}", e));
            return Err(e);
        }
    };
    health.set_healthy(components::OBJECT_STORE);
    health.set_ready(true);

    let count = keys.len();
    for key in keys {
        queue.add(key);
    }
    debug!(count, "Resync queued VNFs");
    Ok(count)
}

/// Turn change notifications and resync ticks into queue entries
async fn feed(
    engine: Arc<ReconcileEngine>,
    queue: Arc<WorkQueue>,
    health: HealthRegistry,
    mut changes: broadcast::Receiver<VnfKey>,
    resync_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + resync_interval, resync_interval);
    let mut watching = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            change = changes.recv(), if watching => match change {
                Ok(key) => queue.add(key),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Change notifications dropped, resyncing");
                    if let Err(e) = resync(&engine, &queue, &health).await {
                        warn!(error = %e, "Resync failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Change feed closed, continuing with periodic resync");
                    watching = false;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = resync(&engine, &queue, &health).await {
                    warn!(error = %e, "Periodic resync failed");
                }
            }
        }
    }
}

async fn process(
    engine: &ReconcileEngine,
    queue: &Arc<WorkQueue>,
    health: &HealthRegistry,
    key: VnfKey,
    cancel: &CancellationToken,
) {
    let result = engine.reconcile(&key, cancel).await;
    queue.done(&key);

    match result {
        Ok(outcome) => {
            // A VNF confirmed running ends any DMS or engine failure streak
            if outcome.phase == Some(Phase::Running) {
                health.record_success(components::DMS);
                health.record_success(components::ENGINE);
            }
            if let Some(delay) = outcome.requeue_after {
                queue.add_after(key, delay);
            }
        }
        Err(LifecycleError::Cancelled) => {
            debug!(vnf = %key, "Pass cancelled");
        }
        Err(e) => {
            // Only transient and internal errors reflect on the operator itself
            match e.kind() {
                ErrorKind::TransientRemote => {
                    health.record_failure(components::DMS, e.to_string());
                }
                ErrorKind::Internal => {
                    health.record_failure(components::ENGINE, e.to_string());
                }
                _ => {}
            }
            let delay = engine.retry_delay(&key).await;
            error!(vnf = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "Reconcile failed");
            queue.add_after(key, delay);
        }
    }
}
