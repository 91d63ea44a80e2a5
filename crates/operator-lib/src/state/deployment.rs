//! Deployment state held in memory for each VNF

use crate::allocator::Envelope;
use crate::error::{ErrorKind, LifecycleError, Severity};
use crate::models::VnfSpec;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Number of events retained per VNF
pub const MAX_EVENTS: usize = 50;

/// Number of error records retained per VNF
pub const MAX_ERROR_HISTORY: usize = 100;

/// Number of health-check error strings retained per VNF
pub const MAX_HEALTH_ERRORS: usize = 10;

/// Lifecycle phase of a VNF deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub enum Phase {
    Initializing,
    Validating,
    Translating,
    Allocating,
    Deploying,
    Running,
    Updating,
    Failed,
    Terminating,
    Terminated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "Initializing",
            Phase::Validating => "Validating",
            Phase::Translating => "Translating",
            Phase::Allocating => "Allocating",
            Phase::Deploying => "Deploying",
            Phase::Running => "Running",
            Phase::Updating => "Updating",
            Phase::Failed => "Failed",
            Phase::Terminating => "Terminating",
            Phase::Terminated => "Terminated",
        }
    }

    /// Phases that belong to the initial provisioning pipeline
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Phase::Initializing
                | Phase::Validating
                | Phase::Translating
                | Phase::Allocating
                | Phase::Deploying
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of a VNF or one of its components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health as last observed by the engine or the health monitor
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthState,
    pub per_component: BTreeMap<String, HealthState>,
    pub last_check: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            overall: HealthState::Unknown,
            per_component: BTreeMap::new(),
            last_check: None,
            errors: Vec::new(),
        }
    }
}

impl HealthStatus {
    /// Record a failed check, keeping only the most recent messages
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        if self.errors.len() > MAX_HEALTH_ERRORS {
            let excess = self.errors.len() - MAX_HEALTH_ERRORS;
            self.errors.drain(0..excess);
        }
    }
}

/// Rolling deployment metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentMetrics {
    /// Duration of the most recent reconcile pass
    pub last_pass_ms: u64,
    /// Time from the first Initializing pass to reaching Running
    pub deployment_time_ms: Option<u64>,
    /// Exponentially smoothed pass error rate in [0, 1]
    pub error_rate: f64,
    pub resource_utilization: BTreeMap<String, f64>,
    pub qos: BTreeMap<String, f64>,
}

impl DeploymentMetrics {
    /// Fold one pass outcome into the smoothed error rate
    pub fn observe_pass(&mut self, duration_ms: u64, failed: bool) {
        self.last_pass_ms = duration_ms;
        self.error_rate = if failed {
            (self.error_rate + 0.1).min(1.0)
        } else {
            (self.error_rate - 0.05).max(0.0)
        };
    }
}

/// A recorded phase failure
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentError {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub message: String,
    pub code: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
}

impl DeploymentError {
    pub fn new(phase: Phase, error: &LifecycleError, recoverable: bool) -> Self {
        let kind = error.kind();
        Self {
            timestamp: Utc::now(),
            phase,
            message: error.to_string(),
            code: error.code().to_string(),
            kind,
            severity: kind.severity(),
            recoverable,
        }
    }
}

/// A significant lifecycle event kept for operators
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Append-only log that drops its oldest entries beyond `capacity`
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }
}

impl<T: Serialize> Serialize for BoundedLog<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

/// Mutable reconciliation state of one VNF
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentState {
    pub phase: Phase,
    /// Spec snapshot taken at Initializing and refreshed by Updating
    pub spec: Option<VnfSpec>,
    pub observed_generation: i64,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Phase whose failure the current retry cycle is recovering from
    pub failed_phase: Option<Phase>,
    pub permanently_failed: bool,
    pub health: HealthStatus,
    pub resources: Option<Envelope>,
    pub metrics: DeploymentMetrics,
    pub error_history: BoundedLog<DeploymentError>,
    pub events: BoundedLog<DeploymentEvent>,
    pub remote_deployment_id: String,
    pub artifacts: Vec<String>,
    pub gitops_revision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub cycle_started_at: Option<DateTime<Utc>>,
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            phase: Phase::Initializing,
            spec: None,
            observed_generation: 0,
            retry_count: 0,
            next_retry_at: None,
            failed_phase: None,
            permanently_failed: false,
            health: HealthStatus::default(),
            resources: None,
            metrics: DeploymentMetrics::default(),
            error_history: BoundedLog::new(MAX_ERROR_HISTORY),
            events: BoundedLog::new(MAX_EVENTS),
            remote_deployment_id: String::new(),
            artifacts: Vec::new(),
            gitops_revision: None,
            created_at: now,
            last_update: now,
            cycle_started_at: None,
        }
    }

    /// Record an event without metadata
    pub fn record_event(&mut self, event_type: &str, description: impl Into<String>) {
        self.record_event_with(event_type, description, BTreeMap::new());
    }

    pub fn record_event_with(
        &mut self,
        event_type: &str,
        description: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) {
        self.events.push(DeploymentEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            description: description.into(),
            metadata,
        });
    }

    /// Record a handler failure and force the phase to `Failed`
    pub fn record_failure(&mut self, error: &LifecycleError, recoverable: bool) {
        let failed_in = self.phase;
        self.error_history
            .push(DeploymentError::new(failed_in, error, recoverable));
        self.failed_phase = Some(failed_in);
        self.phase = Phase::Failed;
        self.last_update = Utc::now();
    }

    /// Whether the backoff window is still open at `now`
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map(|at| now < at).unwrap_or(false)
    }

    /// Last recorded failure message, used as the status reason
    pub fn last_error_message(&self) -> Option<String> {
        self.error_history.last().map(|e| e.message.clone())
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            phase: self.phase,
            health: self.health.overall,
            retry_count: self.retry_count,
            permanently_failed: self.permanently_failed,
            remote_deployment_id: self.remote_deployment_id.clone(),
            last_update: self.last_update,
        }
    }
}

/// Compact view of a VNF's state for listings
#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub phase: Phase,
    pub health: HealthState,
    pub retry_count: u32,
    pub permanently_failed: bool,
    pub remote_deployment_id: String,
    pub last_update: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_starts_initializing() {
        let state = DeploymentState::new();
        assert_eq!(state.phase, Phase::Initializing);
        assert_eq!(state.health.overall, HealthState::Unknown);
        assert!(state.resources.is_none());
        assert!(state.remote_deployment_id.is_empty());
    }

    #[test]
    fn test_events_keep_most_recent_fifty() {
        let mut state = DeploymentState::new();
        for i in 0..1000 {
            state.record_event("Synthetic", format!("event {}", i));
            assert!(state.events.len() <= MAX_EVENTS);
        }

        assert_eq!(state.events.len(), MAX_EVENTS);
        let descriptions: Vec<_> = state.events.iter().map(|e| e.description.clone()).collect();
        let expected: Vec<_> = (950..1000).map(|i| format!("event {}", i)).collect();
        assert_eq!(descriptions, expected);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut state = DeploymentState::new();
        let err = LifecycleError::Timeout("dms".into());
        for _ in 0..(MAX_ERROR_HISTORY + 25) {
            state.phase = Phase::Deploying;
            state.record_failure(&err, true);
        }
        assert_eq!(state.error_history.len(), MAX_ERROR_HISTORY);
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.failed_phase, Some(Phase::Deploying));
    }

    #[test]
    fn test_record_failure_captures_phase_and_kind() {
        let mut state = DeploymentState::new();
        state.phase = Phase::Allocating;
        let err = LifecycleError::InsufficientCapacity {
            site: "edge-01".into(),
            detail: "cpu".into(),
        };
        state.record_failure(&err, true);

        let recorded = state.error_history.last().unwrap();
        assert_eq!(recorded.phase, Phase::Allocating);
        assert_eq!(recorded.kind, ErrorKind::Allocation);
        assert_eq!(recorded.code, "insufficient_capacity");
        assert!(recorded.recoverable);
    }

    #[test]
    fn test_error_rate_smoothing() {
        let mut metrics = DeploymentMetrics::default();
        for _ in 0..20 {
            metrics.observe_pass(5, true);
        }
        assert!((metrics.error_rate - 1.0).abs() < f64::EPSILON);

        metrics.observe_pass(5, false);
        assert!((metrics.error_rate - 0.95).abs() < 1e-9);

        for _ in 0..40 {
            metrics.observe_pass(5, false);
        }
        assert_eq!(metrics.error_rate, 0.0);
    }

    #[test]
    fn test_backoff_window() {
        let mut state = DeploymentState::new();
        let now = Utc::now();
        assert!(!state.in_backoff(now));

        state.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(state.in_backoff(now));
        assert!(!state.in_backoff(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn test_health_errors_bounded() {
        let mut health = HealthStatus::default();
        for i in 0..25 {
            health.push_error(format!("check {}", i));
        }
        assert_eq!(health.errors.len(), MAX_HEALTH_ERRORS);
        assert_eq!(health.errors[0], "check 15");
    }
}
