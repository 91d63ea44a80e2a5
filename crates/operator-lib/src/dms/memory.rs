//! In-process DMS used by tests and local runs
//!
//! Deployments are created in `Creating` and report `Running` from the
//! first status read on, like a DMS that provisions instantly. Faults can
//! be injected per operation, either once or until cleared.

use super::{DmsClient, RemoteDeploymentStatus, RemoteState};
use crate::error::{LifecycleError, LifecycleResult};
use crate::models::VnfIntent;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// DMS operation, used to target injected faults and read call counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmsOperation {
    Create,
    Status,
    Update,
    Delete,
}

impl DmsOperation {
    fn index(self) -> usize {
        match self {
            DmsOperation::Create => 0,
            DmsOperation::Status => 1,
            DmsOperation::Update => 2,
            DmsOperation::Delete => 3,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeDeployment {
    state: RemoteState,
    /// Pinned states are not advanced by status reads
    pinned: bool,
    intent: VnfIntent,
}

#[derive(Debug, Default)]
struct Faults {
    once: HashMap<DmsOperation, VecDeque<LifecycleError>>,
    always: HashMap<DmsOperation, LifecycleError>,
}

/// Fake DMS holding deployments in memory
#[derive(Debug, Default)]
pub struct MemoryDmsClient {
    deployments: Mutex<HashMap<String, FakeDeployment>>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    calls: [AtomicUsize; 4],
}

impl MemoryDmsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier the fake assigns to an intent
    pub fn deployment_id_for(intent: &VnfIntent) -> String {
        let vnf_type = intent
            .spec
            .vnf_type
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!("dms-{}-{}", intent.metadata.name, vnf_type)
    }

    /// Fail the next call of `operation` with `error`
    pub fn fail_next(&self, operation: DmsOperation, error: LifecycleError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.once.entry(operation).or_default().push_back(error);
        }
    }

    /// Fail every call of `operation` until [`clear_faults`](Self::clear_faults)
    pub fn fail_always(&self, operation: DmsOperation, error: LifecycleError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.always.insert(operation, error);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = Faults::default();
        }
    }

    /// Delay every call, to exercise deadlines and cancellation
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut l) = self.latency.lock() {
            *l = latency;
        }
    }

    /// Force the remote state of a deployment; it stays there until changed again
    pub fn set_state(&self, deployment_id: &str, state: RemoteState) -> bool {
        match self.deployments.lock() {
            Ok(mut deployments) => match deployments.get_mut(deployment_id) {
                Some(d) => {
                    d.state = state;
                    d.pinned = true;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn contains(&self, deployment_id: &str) -> bool {
        self.deployments
            .lock()
            .map(|d| d.contains_key(deployment_id))
            .unwrap_or(false)
    }

    pub fn deployment_count(&self) -> usize {
        self.deployments.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Spec last sent for a deployment
    pub fn deployed_intent(&self, deployment_id: &str) -> Option<VnfIntent> {
        self.deployments
            .lock()
            .ok()?
            .get(deployment_id)
            .map(|d| d.intent.clone())
    }

    pub fn calls(&self, operation: DmsOperation) -> usize {
        self.calls[operation.index()].load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: DmsOperation) -> LifecycleResult<()> {
        self.calls[operation.index()].fetch_add(1, Ordering::SeqCst);

        let latency = self.latency.lock().map(|l| *l).unwrap_or(None);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self
            .faults
            .lock()
            .map_err(|_| LifecycleError::internal("fake DMS lock poisoned"))?;
        if let Some(err) = faults.once.get_mut(&operation).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        if let Some(err) = faults.always.get(&operation) {
            return Err(err.clone());
        }
        Ok(())
    }

    fn lock_deployments(
        &self,
    ) -> LifecycleResult<std::sync::MutexGuard<'_, HashMap<String, FakeDeployment>>> {
        self.deployments
            .lock()
            .map_err(|_| LifecycleError::internal("fake DMS lock poisoned"))
    }
}

#[async_trait]
impl DmsClient for MemoryDmsClient {
    async fn create_deployment(&self, intent: &VnfIntent) -> LifecycleResult<String> {
        self.enter(DmsOperation::Create).await?;

        let id = Self::deployment_id_for(intent);
        let mut deployments = self.lock_deployments()?;
        if deployments.contains_key(&id) {
            return Err(LifecycleError::AlreadyExists {
                resource: format!("deployment {}", id),
                existing_id: Some(id),
            });
        }
        deployments.insert(
            id.clone(),
            FakeDeployment {
                state: RemoteState::Creating,
                pinned: false,
                intent: intent.clone(),
            },
        );
        debug!(deployment_id = %id, "Fake DMS created deployment");
        Ok(id)
    }

    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> LifecycleResult<RemoteDeploymentStatus> {
        self.enter(DmsOperation::Status).await?;

        let mut deployments = self.lock_deployments()?;
        let deployment = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| LifecycleError::NotFound(format!("deployment {}", deployment_id)))?;

        if !deployment.pinned
            && matches!(deployment.state, RemoteState::Creating | RemoteState::Updating)
        {
            deployment.state = RemoteState::Running;
        }

        let spec = &deployment.intent.spec;
        let sites: BTreeMap<String, RemoteState> = spec
            .target_sites
            .iter()
            .map(|s| (s.clone(), deployment.state))
            .collect();

        let mut utilization = BTreeMap::new();
        utilization.insert("cpu_cores".to_string(), spec.resources.cpu_cores as f64);
        utilization.insert("memory_gb".to_string(), spec.resources.memory_gb as f64);

        let mut qos = BTreeMap::new();
        qos.insert("bandwidth_mbps".to_string(), spec.qos.bandwidth_mbps);
        qos.insert("latency_ms".to_string(), spec.qos.latency_ms);

        Ok(RemoteDeploymentStatus {
            deployment_id: deployment_id.to_string(),
            state: deployment.state,
            message: None,
            sites,
            utilization,
            qos,
            last_update: Some(Utc::now()),
        })
    }

    async fn update_deployment(
        &self,
        deployment_id: &str,
        intent: &VnfIntent,
    ) -> LifecycleResult<()> {
        self.enter(DmsOperation::Update).await?;

        let mut deployments = self.lock_deployments()?;
        let deployment = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| LifecycleError::NotFound(format!("deployment {}", deployment_id)))?;
        deployment.intent = intent.clone();
        deployment.state = RemoteState::Updating;
        deployment.pinned = false;
        Ok(())
    }

    async fn delete_deployment(&self, deployment_id: &str) -> LifecycleResult<()> {
        self.enter(DmsOperation::Delete).await?;

        let mut deployments = self.lock_deployments()?;
        if deployments.remove(deployment_id).is_none() {
            debug!(deployment_id, "Fake DMS delete of unknown deployment");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{VnfKey, VnfSpec, VnfType};

    fn intent(name: &str) -> VnfIntent {
        VnfIntent::new(
            &VnfKey::new("default", name),
            VnfSpec {
                vnf_type: Some(VnfType::Upf),
                target_sites: vec!["edge-01".into()],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dms = MemoryDmsClient::new();
        let id = dms.create_deployment(&intent("upf-1")).await.unwrap();
        assert_eq!(id, "dms-upf-1-UPF");

        let status = dms.get_deployment_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteState::Running);
        assert_eq!(status.sites.len(), 1);

        dms.update_deployment(&id, &intent("upf-1")).await.unwrap();
        let status = dms.get_deployment_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteState::Running);

        dms.delete_deployment(&id).await.unwrap();
        assert!(!dms.contains(&id));
        // Deleting again is still fine
        dms.delete_deployment(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_create_reports_existing() {
        let dms = MemoryDmsClient::new();
        let id = dms.create_deployment(&intent("upf-1")).await.unwrap();
        let err = dms.create_deployment(&intent("upf-1")).await.unwrap_err();
        match err {
            LifecycleError::AlreadyExists { existing_id, .. } => {
                assert_eq!(existing_id, Some(id))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let dms = MemoryDmsClient::new();
        dms.fail_next(DmsOperation::Create, LifecycleError::Timeout("create".into()));
        assert!(dms.create_deployment(&intent("a")).await.is_err());
        assert!(dms.create_deployment(&intent("a")).await.is_ok());

        dms.fail_always(DmsOperation::Status, LifecycleError::Unavailable("down".into()));
        assert!(dms.get_deployment_status("dms-a-UPF").await.is_err());
        assert!(dms.get_deployment_status("dms-a-UPF").await.is_err());
        dms.clear_faults();
        assert!(dms.get_deployment_status("dms-a-UPF").await.is_ok());
        assert_eq!(dms.calls(DmsOperation::Status), 3);
    }

    #[tokio::test]
    async fn test_pinned_state() {
        let dms = MemoryDmsClient::new();
        let id = dms.create_deployment(&intent("a")).await.unwrap();
        assert!(dms.set_state(&id, RemoteState::Failed));
        let status = dms.get_deployment_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteState::Failed);
        assert!(!dms.set_state("missing", RemoteState::Failed));
    }
}
