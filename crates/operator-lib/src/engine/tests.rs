use super::*;
use crate::allocator::SiteQuota;
use crate::dms::{DmsOperation, MemoryDmsClient, RemoteState};
use crate::generator::ArtifactSet;
use crate::gitops::DirectoryGitOps;
use crate::models::{ImageRef, QosRequest, ResourceRequest, VnfSpec, VnfType};
use crate::state::HealthState;
use crate::store::MemoryObjectStore;
use async_trait::async_trait;
use std::collections::HashMap;

struct Harness {
    engine: Arc<ReconcileEngine>,
    store: Arc<MemoryObjectStore>,
    dms: Arc<MemoryDmsClient>,
    allocator: Arc<QuotaAllocator>,
}

struct Setup {
    config: EngineConfig,
    allocator: QuotaAllocator,
    generator: Option<Arc<dyn PackageGenerator>>,
    gitops: Option<Arc<dyn GitOpsClient>>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: test_config(),
            allocator: QuotaAllocator::unbounded(),
            generator: None,
            gitops: None,
        }
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        backoff: BackoffPolicy::immediate(5),
        call_timeout: Duration::from_secs(2),
        monitor: MonitorConfig {
            interval: Duration::from_secs(3600),
            check_timeout: Duration::from_secs(1),
        },
        ..Default::default()
    }
}

impl Harness {
    fn new() -> Self {
        Self::with(Setup::default())
    }

    fn with(setup: Setup) -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let dms = Arc::new(MemoryDmsClient::new());
        let allocator = Arc::new(setup.allocator);

        let mut builder = ReconcileEngine::builder()
            .store(store.clone())
            .dms(dms.clone())
            .allocator(allocator.clone())
            .config(setup.config);
        if let Some(generator) = setup.generator {
            builder = builder.generator(generator);
        }
        if let Some(gitops) = setup.gitops {
            builder = builder.gitops(gitops);
        }

        Self {
            engine: Arc::new(builder.build().unwrap()),
            store,
            dms,
            allocator,
        }
    }

    async fn pass(&self, key: &VnfKey) -> LifecycleResult<ReconcileOutcome> {
        self.engine.reconcile(key, &CancellationToken::new()).await
    }

    async fn phase(&self, key: &VnfKey) -> Option<Phase> {
        self.engine.status(key).await.map(|s| s.phase)
    }

    async fn state(&self, key: &VnfKey) -> DeploymentState {
        self.engine.status(key).await.expect("state should exist")
    }

    /// Run passes until `target` is reached, returning how many it took
    async fn drive(&self, key: &VnfKey, target: Phase, max_passes: usize) -> usize {
        for n in 1..=max_passes {
            let _ = self.pass(key).await;
            if self.phase(key).await == Some(target) {
                return n;
            }
        }
        panic!(
            "{} did not reach {} within {} passes (at {:?})",
            key,
            target,
            max_passes,
            self.phase(key).await
        );
    }
}

fn ran_spec() -> VnfSpec {
    VnfSpec {
        vnf_type: Some(VnfType::Ran),
        version: "1.0.0".into(),
        image: ImageRef {
            repository: "registry.local/oran/ran".into(),
            tag: "1.0.0".into(),
        },
        resources: ResourceRequest {
            cpu_cores: 2,
            memory_gb: 4,
        },
        qos: QosRequest {
            bandwidth_mbps: 4.5,
            latency_ms: 10.0,
            ..Default::default()
        },
        target_sites: vec!["edge-01".into(), "edge-02".into()],
        ..Default::default()
    }
}

fn event_types(state: &DeploymentState) -> Vec<String> {
    state.events.iter().map(|e| e.event_type.clone()).collect()
}

struct BrokenGenerator;

#[async_trait]
impl PackageGenerator for BrokenGenerator {
    async fn generate(&self, _intent: &VnfIntent) -> LifecycleResult<ArtifactSet> {
        Err(LifecycleError::packaging("template rendering failed"))
    }

    async fn validate(&self, _artifacts: &ArtifactSet) -> LifecycleResult<()> {
        Ok(())
    }
}

struct UnreachableGitOps;

#[async_trait]
impl GitOpsClient for UnreachableGitOps {
    async fn push(&self, _artifacts: &ArtifactSet) -> LifecycleResult<String> {
        Err(LifecycleError::Unavailable("git remote unreachable".into()))
    }
}

#[tokio::test]
async fn test_ran_reaches_running() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();

    let passes = h.drive(&key, Phase::Running, 6).await;
    assert!(passes <= 6);

    let state = h.state(&key).await;
    assert!(!state.remote_deployment_id.is_empty());
    assert_eq!(state.retry_count, 0);
    assert!(state.error_history.is_empty());
    assert!(state.metrics.deployment_time_ms.is_some());

    let envelope = state.resources.as_ref().unwrap();
    assert_eq!(envelope.sites, ran_spec().target_sites);
    assert_eq!(envelope.storage_gb, 8);
    assert_eq!(h.allocator.usage("edge-01").cpu_cores, 2);
    assert_eq!(h.allocator.usage("edge-02").memory_gb, 4);

    let intent = h.store.get(&key).await.unwrap();
    assert_eq!(intent.status.phase, "Running");
    assert_eq!(intent.status.deployed_sites, ran_spec().target_sites);
    assert_eq!(intent.status.remote_deployment_id, state.remote_deployment_id);
    assert!(intent.metadata.has_finalizer(VNF_FINALIZER));
    assert!(h.engine.monitor().is_monitoring(&key));
    assert_eq!(h.dms.calls(DmsOperation::Create), 1);
}

#[tokio::test]
async fn test_phases_advance_in_order() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        let outcome = h.pass(&key).await.unwrap();
        assert!(outcome.handled);
        seen.push(outcome.phase.unwrap());
    }
    assert_eq!(
        seen,
        vec![
            Phase::Validating,
            Phase::Translating,
            Phase::Allocating,
            Phase::Deploying,
            Phase::Running,
        ]
    );

    let transitions: Vec<String> = h
        .state(&key)
        .await
        .events
        .iter()
        .filter(|e| e.event_type == "PhaseTransition")
        .map(|e| e.description.clone())
        .collect();
    assert_eq!(transitions.first().unwrap(), "Initializing -> Validating");
    assert_eq!(transitions.last().unwrap(), "Deploying -> Running");
}

#[tokio::test]
async fn test_running_pass_polls_and_requeues() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;

    let outcome = h.pass(&key).await.unwrap();
    assert_eq!(outcome.phase, Some(Phase::Running));
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(300)));

    let state = h.state(&key).await;
    assert_eq!(state.health.overall, HealthState::Healthy);
    assert_eq!(state.metrics.qos.get("bandwidth_mbps"), Some(&4.5));
}

#[tokio::test]
async fn test_transient_status_error_degrades_without_failing() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;

    h.dms.fail_next(
        DmsOperation::Status,
        LifecycleError::Unavailable("503 from DMS".into()),
    );
    let outcome = h.pass(&key).await.unwrap();
    assert_eq!(outcome.phase, Some(Phase::Running));
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(60)));

    let state = h.state(&key).await;
    assert_eq!(state.health.overall, HealthState::Degraded);
    assert!(state.error_history.is_empty());
}

#[test]
fn test_validate_spec_rules() {
    assert!(validate_spec(&ran_spec()).is_ok());

    let cases: Vec<(Box<dyn Fn(&mut VnfSpec)>, &str)> = vec![
        (Box::new(|s: &mut VnfSpec| s.vnf_type = None), "type"),
        (Box::new(|s: &mut VnfSpec| s.version.clear()), "version"),
        (Box::new(|s: &mut VnfSpec| s.image.repository.clear()), "repository"),
        (Box::new(|s: &mut VnfSpec| s.image.tag.clear()), "tag"),
        (Box::new(|s: &mut VnfSpec| s.resources.cpu_cores = 0), "CPU"),
        (Box::new(|s: &mut VnfSpec| s.resources.memory_gb = 0), "memory"),
        (Box::new(|s: &mut VnfSpec| s.target_sites.clear()), "target site"),
        (Box::new(|s: &mut VnfSpec| s.qos.latency_ms = -1.0), "latency"),
    ];
    for (mutate, expected) in cases {
        let mut spec = ran_spec();
        mutate(&mut spec);
        let err = validate_spec(&spec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains(expected), "{} vs {}", err, expected);
    }

    // Type is reported before anything else
    let err = validate_spec(&VnfSpec::default()).unwrap_err();
    assert!(err.to_string().contains("type"));
}

#[tokio::test]
async fn test_invalid_spec_waits_for_spec_change() {
    let h = Harness::new();
    let key = VnfKey::new("default", "bad-ran");
    let mut spec = ran_spec();
    spec.resources.cpu_cores = 0;
    h.store.apply(&key, spec).unwrap();

    let mut failures = 0;
    for _ in 0..10 {
        if h.pass(&key).await.is_err() {
            failures += 1;
        }
        if h.state(&key).await.permanently_failed {
            break;
        }
    }
    assert_eq!(failures, 1);

    let state = h.state(&key).await;
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.error_history.len(), 1);
    assert!(state.next_retry_at.is_none());
    let permanent = state
        .events
        .iter()
        .find(|e| e.event_type == "PermanentFailure")
        .unwrap();
    assert!(permanent.description.starts_with("Waiting for a spec change"));

    // Stays put until the spec changes
    let outcome = h.pass(&key).await.unwrap();
    assert!(!outcome.handled);
    assert_eq!(outcome.requeue_after, None);
    assert_eq!(h.state(&key).await.error_history.len(), 1);
    assert_eq!(h.dms.calls(DmsOperation::Create), 0);

    let status = h.store.get(&key).await.unwrap().status;
    assert_eq!(status.phase, "Failed");
    assert!(status.permanent_failure);
    assert!(status.message.unwrap().contains("CPU cores"));
}

#[tokio::test]
async fn test_rejected_deploy_fails_permanently_after_max_retries_plus_one() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.dms.fail_always(
        DmsOperation::Create,
        LifecycleError::Rejected {
            status: 403,
            message: "forbidden".into(),
        },
    );

    let mut failures = 0;
    for _ in 0..100 {
        if h.pass(&key).await.is_err() {
            failures += 1;
        }
        if h.state(&key).await.permanently_failed {
            break;
        }
    }
    assert_eq!(failures, 6);

    let state = h.state(&key).await;
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.retry_count, 5);
    assert_eq!(state.error_history.len(), 6);
    assert_eq!(h.dms.calls(DmsOperation::Create), 6);
    assert!(event_types(&state).contains(&"PermanentFailure".to_string()));

    let outcome = h.pass(&key).await.unwrap();
    assert!(!outcome.handled);
    assert_eq!(h.dms.calls(DmsOperation::Create), 6);

    let status = h.store.get(&key).await.unwrap().status;
    assert!(status.permanent_failure);
    assert!(status.message.unwrap().contains("forbidden"));
}

#[tokio::test]
async fn test_spec_change_restarts_permanently_failed_vnf() {
    let mut setup = Setup::default();
    setup.config.backoff = BackoffPolicy::immediate(0);
    let h = Harness::with(setup);
    let key = VnfKey::new("default", "bad-ran");
    let mut spec = ran_spec();
    spec.version.clear();
    h.store.apply(&key, spec).unwrap();

    for _ in 0..4 {
        let _ = h.pass(&key).await;
    }
    assert!(h.state(&key).await.permanently_failed);

    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 8).await;

    let state = h.state(&key).await;
    assert!(!state.permanently_failed);
    assert_eq!(state.observed_generation, 2);
    assert!(!h.store.get(&key).await.unwrap().status.permanent_failure);
}

#[tokio::test]
async fn test_backoff_window_defers_handler() {
    let mut setup = Setup::default();
    setup.config.backoff = BackoffPolicy {
        initial_backoff: Duration::from_secs(60),
        multiplier: 2.0,
        max_backoff: Duration::from_secs(600),
        max_retries: 5,
    };
    let h = Harness::with(setup);
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Deploying, 5).await;

    h.dms.fail_always(
        DmsOperation::Create,
        LifecycleError::Rejected {
            status: 403,
            message: "forbidden".into(),
        },
    );
    assert!(h.pass(&key).await.is_err());

    let scheduled = h.pass(&key).await.unwrap();
    assert_eq!(scheduled.phase, Some(Phase::Failed));
    assert_eq!(scheduled.requeue_after, Some(Duration::from_secs(60)));

    let deferred = h.pass(&key).await.unwrap();
    assert!(!deferred.handled);
    assert_eq!(deferred.phase, Some(Phase::Failed));
    let wait = deferred.requeue_after.unwrap();
    assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60));

    let state = h.state(&key).await;
    assert_eq!(state.retry_count, 1);
    assert_eq!(state.error_history.len(), 1);
    assert!(h.store.get(&key).await.unwrap().status.next_retry_at.is_some());
    assert!(h.engine.retry_delay(&key).await > Duration::from_secs(50));
}

#[tokio::test]
async fn test_transient_deploy_failure_is_remediated() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.dms.fail_next(
        DmsOperation::Create,
        LifecycleError::Unavailable("DMS returned 503".into()),
    );

    h.drive(&key, Phase::Failed, 5).await;
    let failed = h.state(&key).await;
    assert_eq!(failed.failed_phase, Some(Phase::Deploying));
    assert!(failed.error_history.last().unwrap().recoverable);

    h.drive(&key, Phase::Running, 8).await;
    let state = h.state(&key).await;
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.failed_phase, None);
    assert_eq!(state.error_history.len(), 1);
    assert!(event_types(&state).contains(&"RemediationSucceeded".to_string()));
    assert_eq!(h.allocator.active_reservations(), 2);
}

#[tokio::test]
async fn test_remote_failure_recreates_deployment() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;
    let id = h.state(&key).await.remote_deployment_id;

    h.dms.set_state(&id, RemoteState::Failed);
    assert!(h.pass(&key).await.is_err());
    assert_eq!(h.phase(&key).await, Some(Phase::Failed));

    h.drive(&key, Phase::Running, 8).await;
    assert_eq!(h.dms.calls(DmsOperation::Delete), 1);
    assert_eq!(h.dms.calls(DmsOperation::Create), 2);
    assert!(h.dms.contains(&id));
    assert_eq!(h.state(&key).await.remote_deployment_id, id);
}

#[tokio::test]
async fn test_existing_remote_deployment_is_adopted() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    let intent = h.store.apply(&key, ran_spec()).unwrap();
    let existing = h.dms.create_deployment(&intent).await.unwrap();

    h.drive(&key, Phase::Running, 6).await;

    let state = h.state(&key).await;
    assert_eq!(state.remote_deployment_id, existing);
    assert!(event_types(&state).contains(&"DeploymentAdopted".to_string()));
    assert_eq!(h.dms.deployment_count(), 1);
}

#[tokio::test]
async fn test_generation_change_updates_remote() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;
    let id = h.state(&key).await.remote_deployment_id;

    let mut spec = ran_spec();
    spec.version = "1.1.0".into();
    spec.resources.cpu_cores = 4;
    h.store.apply(&key, spec).unwrap();

    let outcome = h.pass(&key).await.unwrap();
    assert_eq!(outcome.phase, Some(Phase::Updating));
    let outcome = h.pass(&key).await.unwrap();
    assert_eq!(outcome.phase, Some(Phase::Running));

    let state = h.state(&key).await;
    assert_eq!(state.observed_generation, 2);
    assert_eq!(h.dms.calls(DmsOperation::Update), 1);
    assert_eq!(h.dms.deployed_intent(&id).unwrap().spec.version, "1.1.0");
    assert_eq!(h.allocator.usage("edge-01").cpu_cores, 4);
    assert_eq!(h.allocator.active_reservations(), 2);
    assert_eq!(h.store.get(&key).await.unwrap().status.observed_generation, 2);
}

#[tokio::test]
async fn test_failed_update_keeps_previous_envelope() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;

    let mut spec = ran_spec();
    spec.resources.cpu_cores = 4;
    h.store.apply(&key, spec).unwrap();
    h.dms.fail_next(
        DmsOperation::Update,
        LifecycleError::Unavailable("DMS returned 503".into()),
    );

    assert_eq!(h.pass(&key).await.unwrap().phase, Some(Phase::Updating));
    assert!(h.pass(&key).await.is_err());

    let state = h.state(&key).await;
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.failed_phase, Some(Phase::Updating));
    assert_eq!(state.resources.as_ref().unwrap().cpu_cores, 2);
    assert_eq!(h.allocator.usage("edge-01").cpu_cores, 2);
    assert_eq!(h.allocator.active_reservations(), 2);

    h.store.request_deletion(&key).unwrap();
    for _ in 0..5 {
        let _ = h.pass(&key).await;
        if h.engine.status(&key).await.is_none() {
            break;
        }
    }
    assert!(h.engine.status(&key).await.is_none());
    assert_eq!(h.allocator.active_reservations(), 0);
    assert_eq!(h.allocator.total_cores(), 0);
}

#[tokio::test]
async fn test_invalid_update_never_reaches_remote() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;
    let id = h.state(&key).await.remote_deployment_id;

    let mut spec = ran_spec();
    spec.resources.cpu_cores = 0;
    h.store.apply(&key, spec).unwrap();

    assert_eq!(h.pass(&key).await.unwrap().phase, Some(Phase::Updating));
    let err = h.pass(&key).await.unwrap_err();
    assert_eq!(err.code(), "validation");

    let state = h.state(&key).await;
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.failed_phase, Some(Phase::Updating));
    assert_eq!(state.observed_generation, 1);
    assert_eq!(h.dms.calls(DmsOperation::Update), 0);
    assert_eq!(h.dms.deployed_intent(&id).unwrap().spec.resources.cpu_cores, 2);
    assert_eq!(h.allocator.usage("edge-01").cpu_cores, 2);

    h.pass(&key).await.unwrap();
    let state = h.state(&key).await;
    assert!(state.permanently_failed);
    assert_eq!(state.observed_generation, 2);

    // Parked on the rejected generation, the running deployment keeps its envelope
    let outcome = h.pass(&key).await.unwrap();
    assert!(!outcome.handled);
    assert_eq!(h.dms.calls(DmsOperation::Update), 0);
    assert_eq!(h.allocator.usage("edge-01").cpu_cores, 2);
    assert_eq!(h.allocator.active_reservations(), 2);
}

#[tokio::test]
async fn test_generation_change_wins_over_remote_state() {
    for remote in [RemoteState::Failed, RemoteState::Creating] {
        let h = Harness::new();
        let key = VnfKey::new("default", "ran-edge");
        h.store.apply(&key, ran_spec()).unwrap();
        h.drive(&key, Phase::Running, 6).await;
        let id = h.state(&key).await.remote_deployment_id;
        assert!(h.dms.set_state(&id, remote));

        let mut spec = ran_spec();
        spec.version = "1.1.0".into();
        h.store.apply(&key, spec).unwrap();

        let outcome = h.pass(&key).await.unwrap();
        assert_eq!(outcome.phase, Some(Phase::Updating), "remote {:?}", remote);
        let outcome = h.pass(&key).await.unwrap();
        assert_eq!(outcome.phase, Some(Phase::Running), "remote {:?}", remote);

        let state = h.state(&key).await;
        assert_eq!(state.observed_generation, 2);
        assert!(state.error_history.is_empty(), "remote {:?}", remote);
        assert_eq!(h.dms.calls(DmsOperation::Update), 1);
        assert_eq!(h.dms.deployed_intent(&id).unwrap().spec.version, "1.1.0");

        // The update unpins the remote, so the next poll sees it converge
        let outcome = h.pass(&key).await.unwrap();
        assert_eq!(outcome.phase, Some(Phase::Running));
        assert_eq!(h.state(&key).await.health.overall, HealthState::Healthy);
    }
}

#[tokio::test]
async fn test_deletion_from_running() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;
    let id = h.state(&key).await.remote_deployment_id;

    h.store.request_deletion(&key).unwrap();
    let outcome = h.pass(&key).await.unwrap();

    assert_eq!(outcome.phase, Some(Phase::Terminated));
    assert_eq!(outcome.requeue_after, None);
    assert!(!h.dms.contains(&id));
    assert_eq!(h.allocator.active_reservations(), 0);
    assert!(!h.engine.monitor().is_monitoring(&key));
    assert!(h.engine.status(&key).await.is_none());
    assert!(!h.store.contains(&key));
}

#[tokio::test]
async fn test_deletion_bypasses_backoff() {
    let mut setup = Setup::default();
    setup.config.backoff = BackoffPolicy::default();
    let h = Harness::with(setup);
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;
    let id = h.state(&key).await.remote_deployment_id;

    // Remote failure whose recreate remediation cannot delete, leaving a backoff
    h.dms.set_state(&id, RemoteState::Failed);
    h.dms.fail_always(
        DmsOperation::Delete,
        LifecycleError::Rejected {
            status: 403,
            message: "forbidden".into(),
        },
    );
    assert!(h.pass(&key).await.is_err());
    h.pass(&key).await.unwrap();
    let state = h.state(&key).await;
    assert!(state.in_backoff(Utc::now()));

    h.dms.clear_faults();
    h.store.request_deletion(&key).unwrap();
    let outcome = h.pass(&key).await.unwrap();

    assert_eq!(outcome.phase, Some(Phase::Terminated));
    assert!(!h.dms.contains(&id));
    assert_eq!(h.allocator.active_reservations(), 0);
    assert!(!h.store.contains(&key));
}

#[tokio::test]
async fn test_deletion_before_deploy_releases_resources() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Deploying, 5).await;
    assert_eq!(h.allocator.active_reservations(), 2);

    h.store.request_deletion(&key).unwrap();
    h.pass(&key).await.unwrap();

    assert_eq!(h.allocator.active_reservations(), 0);
    assert_eq!(h.dms.calls(DmsOperation::Delete), 0);
    assert!(!h.store.contains(&key));
}

#[tokio::test]
async fn test_vanished_intent_drops_state() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Deploying, 5).await;

    // Strip the finalizer behind the engine's back, then delete
    let mut intent = h.store.get(&key).await.unwrap();
    intent.metadata.finalizers.clear();
    h.store.update(&intent).await.unwrap();
    h.store.request_deletion(&key).unwrap();

    let outcome = h.pass(&key).await.unwrap();
    assert_eq!(outcome.phase, None);
    assert!(h.engine.status(&key).await.is_none());
    assert_eq!(h.allocator.active_reservations(), 0);
}

#[tokio::test]
async fn test_insufficient_capacity_backs_off() {
    let mut quotas = HashMap::new();
    quotas.insert(
        "edge-01".to_string(),
        SiteQuota {
            cpu_cores: 1,
            memory_gb: 64,
            storage_gb: 128,
            bandwidth_mbps: 1000.0,
        },
    );
    let h = Harness::with(Setup {
        allocator: QuotaAllocator::with_quotas(quotas),
        ..Default::default()
    });
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();

    h.drive(&key, Phase::Failed, 5).await;
    let state = h.state(&key).await;
    let error = state.error_history.last().unwrap();
    assert_eq!(error.phase, Phase::Allocating);
    assert_eq!(error.code, "insufficient_capacity");
    assert!(error.recoverable);
    assert_eq!(h.allocator.active_reservations(), 0);
}

#[tokio::test]
async fn test_packaging_failure_is_recorded() {
    let h = Harness::with(Setup {
        generator: Some(Arc::new(BrokenGenerator)),
        ..Default::default()
    });
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();

    h.pass(&key).await.unwrap();
    h.pass(&key).await.unwrap();
    let err = h.pass(&key).await.unwrap_err();
    assert_eq!(err.code(), "packaging");

    let state = h.state(&key).await;
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.failed_phase, Some(Phase::Translating));
    assert!(!state.error_history.last().unwrap().recoverable);
    assert!(state.artifacts.is_empty());
}

#[tokio::test]
async fn test_gitops_push_records_revision() {
    let dir = tempfile::tempdir().unwrap();
    let gitops = Arc::new(DirectoryGitOps::new(dir.path()));
    let h = Harness::with(Setup {
        gitops: Some(gitops.clone()),
        ..Default::default()
    });
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;

    let state = h.state(&key).await;
    assert!(state.gitops_revision.as_deref().unwrap().starts_with("rev-"));
    assert_eq!(state.artifacts.len(), 5);
    assert!(gitops.package_dir("default", "ran-edge-ran").join("Kptfile").exists());
}

#[tokio::test]
async fn test_gitops_failure_is_best_effort_unless_gated() {
    let h = Harness::with(Setup {
        gitops: Some(Arc::new(UnreachableGitOps)),
        ..Default::default()
    });
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;
    assert!(event_types(&h.state(&key).await).contains(&"PackagePushFailed".to_string()));

    let mut setup = Setup {
        gitops: Some(Arc::new(UnreachableGitOps)),
        ..Default::default()
    };
    setup.config.gate_deploy_on_push = true;
    let gated = Harness::with(setup);
    gated.store.apply(&key, ran_spec()).unwrap();
    gated.drive(&key, Phase::Failed, 5).await;
    let state = gated.state(&key).await;
    assert_eq!(state.failed_phase, Some(Phase::Translating));
    assert_eq!(state.error_history.last().unwrap().code, "unavailable");
}

#[tokio::test]
async fn test_cancellation_records_nothing() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Deploying, 5).await;

    h.dms.set_latency(Some(Duration::from_secs(5)));
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    };
    let (result, _) = tokio::join!(h.engine.reconcile(&key, &cancel), canceller);

    assert!(matches!(result, Err(LifecycleError::Cancelled)));
    let state = h.state(&key).await;
    assert_eq!(state.phase, Phase::Deploying);
    assert!(state.error_history.is_empty());
    assert!(state.remote_deployment_id.is_empty());
}

#[tokio::test]
async fn test_remote_call_deadline() {
    let mut setup = Setup::default();
    setup.config.call_timeout = Duration::from_millis(50);
    let h = Harness::with(setup);
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Deploying, 5).await;

    h.dms.set_latency(Some(Duration::from_millis(300)));
    let err = h.pass(&key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientRemote);
    assert_eq!(h.dms.deployment_count(), 0);

    h.dms.set_latency(None);
    h.drive(&key, Phase::Running, 8).await;
}

#[tokio::test]
async fn test_concurrent_passes_are_serialised() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&h.engine);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            engine.reconcile(&key, &CancellationToken::new()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.phase(&key).await, Some(Phase::Running));
    assert_eq!(h.dms.calls(DmsOperation::Create), 1);
    assert_eq!(h.allocator.active_reservations(), 2);
}

#[tokio::test]
async fn test_event_log_stays_bounded() {
    let h = Harness::new();
    let key = VnfKey::new("default", "ran-edge");
    h.store.apply(&key, ran_spec()).unwrap();
    h.drive(&key, Phase::Running, 6).await;

    for minor in 1..=30 {
        let mut spec = ran_spec();
        spec.version = format!("1.{}.0", minor);
        h.store.apply(&key, spec).unwrap();
        h.pass(&key).await.unwrap();
        h.pass(&key).await.unwrap();
    }

    let state = h.state(&key).await;
    assert_eq!(state.events.len(), crate::state::MAX_EVENTS);
    assert_eq!(state.observed_generation, 31);
    assert_eq!(state.events.last().unwrap().event_type, "PhaseTransition");
}

#[tokio::test]
async fn test_recoverable_classification() {
    let h = Harness::new();
    let engine = &h.engine;

    assert!(engine.is_recoverable(&LifecycleError::Timeout("status".into())));
    assert!(engine.is_recoverable(&LifecycleError::InsufficientCapacity {
        site: "edge-01".into(),
        detail: "cpu".into(),
    }));
    assert!(engine.is_recoverable(&LifecycleError::internal("connection reset by peer")));
    assert!(!engine.is_recoverable(&LifecycleError::internal("unexpected state")));
    assert!(!engine.is_recoverable(&LifecycleError::validation("connection timeout field missing")));
    assert!(!engine.is_recoverable(&LifecycleError::Rejected {
        status: 400,
        message: "temporary".into(),
    }));
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    assert!(ReconcileEngine::builder().build().is_err());
    assert!(ReconcileEngine::builder()
        .store(Arc::new(MemoryObjectStore::new()))
        .build()
        .is_err());
}
