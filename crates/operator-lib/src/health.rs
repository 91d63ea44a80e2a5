//! Operator self-health for the liveness and readiness endpoints
//!
//! Covers the operator's own moving parts: the engine, the controller
//! loop, the DMS connection and the object store. Per-VNF health lives in
//! the deployment state instead.
//!
//! Components report either explicit states or a stream of pass results.
//! A run of failures degrades a component once it reaches the registry's
//! threshold, and the first success clears it again.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Consecutive failures before a component is reported degraded
pub const DEFAULT_DEGRADE_AFTER: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but failing often or running on a fallback
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failures recorded since the last success
    #[serde(default)]
    pub consecutive_failures: u32,
    /// When the status last changed
    pub since: DateTime<Utc>,
    pub last_check: DateTime<Utc>,
    /// Status was set by a failure streak rather than explicitly
    #[serde(skip)]
    from_streak: bool,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            status,
            message,
            consecutive_failures: 0,
            since: now,
            last_check: now,
            from_streak: false,
        }
    }

    /// Move to `status`, keeping `since` when nothing changed
    fn transition(&mut self, status: ComponentStatus, message: Option<String>) {
        let now = Utc::now();
        if self.status != status {
            self.since = now;
        }
        self.status = status;
        self.message = message;
        self.last_check = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across `components`; healthy when there are none
    pub fn compute_status<'a>(
        components: impl IntoIterator<Item = &'a ComponentHealth>,
    ) -> ComponentStatus {
        components
            .into_iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names
pub mod components {
    pub const ENGINE: &str = "engine";
    pub const CONTROLLER: &str = "controller";
    pub const DMS: &str = "dms";
    pub const OBJECT_STORE: &str = "object_store";

    pub const ALL: [&str; 4] = [ENGINE, CONTROLLER, DMS, OBJECT_STORE];
}

/// Shared component health table, cheap to clone
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<DashMap<String, ComponentHealth>>,
    ready: Arc<AtomicBool>,
    degrade_after: u32,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(DashMap::new()),
            ready: Arc::new(AtomicBool::new(false)),
            degrade_after: DEFAULT_DEGRADE_AFTER,
        }
    }

    pub fn with_degrade_after(mut self, failures: u32) -> Self {
        self.degrade_after = failures.max(1);
        self
    }

    /// Registry with every operator component registered healthy
    pub fn for_operator() -> Self {
        let registry = Self::new();
        for name in components::ALL {
            registry.register(name);
        }
        registry
    }

    pub fn register(&self, name: &str) {
        self.components.insert(
            name.to_string(),
            ComponentHealth::new(ComponentStatus::Healthy, None),
        );
    }

    fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut entry = self
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::new(status, None));
        entry.consecutive_failures = 0;
        entry.from_streak = false;
        entry.transition(status, message);
    }

    pub fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None);
    }

    pub fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into()));
    }

    pub fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into()));
    }

    /// Count a failed operation against `name`, returning the streak length
    ///
    /// A healthy component turns degraded once the streak reaches the
    /// threshold. Components already worse than that are left alone.
    pub fn record_failure(&self, name: &str, message: impl Into<String>) -> u32 {
        let mut entry = self
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::new(ComponentStatus::Healthy, None));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_check = Utc::now();

        if entry.consecutive_failures >= self.degrade_after
            && entry.status == ComponentStatus::Healthy
        {
            let streak = entry.consecutive_failures;
            entry.transition(
                ComponentStatus::Degraded,
                Some(format!("{} consecutive failures, last: {}", streak, message.into())),
            );
            entry.from_streak = true;
        }
        entry.consecutive_failures
    }

    /// Count a successful operation against `name`
    ///
    /// Ends a failure streak. A status set explicitly, with no streak
    /// behind it, is kept.
    pub fn record_success(&self, name: &str) {
        let Some(mut entry) = self.components.get_mut(name) else {
            return;
        };
        entry.last_check = Utc::now();
        entry.consecutive_failures = 0;
        if entry.from_streak {
            entry.from_streak = false;
            entry.transition(ComponentStatus::Healthy, None);
        }
    }

    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.get(name).map(|c| c.value().clone())
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthResponse {
        let components: BTreeMap<String, ComponentHealth> = self
            .components
            .iter()
            .map(|c| (c.key().clone(), c.value().clone()))
            .collect();
        let status = HealthResponse::compute_status(components.values());
        HealthResponse { status, components }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        if !self.is_ready() {
            return ReadinessResponse {
                ready: false,
                reason: Some("Operator has not completed its first resync".to_string()),
            };
        }

        let health = self.health();
        let unhealthy = health
            .components
            .iter()
            .find(|(_, c)| !c.status.is_operational());
        match unhealthy {
            Some((name, c)) => ReadinessResponse {
                ready: false,
                reason: Some(match &c.message {
                    Some(message) => format!("{} unhealthy: {}", name, message),
                    None => format!("{} unhealthy", name),
                }),
            },
            None => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}
