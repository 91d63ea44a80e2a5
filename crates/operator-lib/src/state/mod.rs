//! Per-VNF reconciliation state
//!
//! This module provides:
//! - The lifecycle `Phase` enum and the in-memory `DeploymentState`
//! - Bounded audit logs for events and errors
//! - `VnfStateStore`, the concurrent map from VNF identity to its state

mod deployment;
mod store;

pub use deployment::{
    BoundedLog, DeploymentError, DeploymentEvent, DeploymentMetrics, DeploymentState,
    HealthState, HealthStatus, Phase, StateSummary, MAX_ERROR_HISTORY, MAX_EVENTS,
    MAX_HEALTH_ERRORS,
};
pub use store::{StateEntry, VnfStateStore};
