//! VNF lifecycle operator library
//!
//! This crate provides the core functionality for:
//! - Phase-based reconciliation of declared VNFs against a remote DMS
//! - Per-site resource allocation and deployment package generation
//! - Failure analysis, retry backoff and automated remediation
//! - Per-VNF health monitoring
//! - Health checks and observability for the operator itself

pub mod allocator;
pub mod analyzer;
pub mod controller;
pub mod dms;
pub mod engine;
pub mod error;
pub mod generator;
pub mod gitops;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod retry;
pub mod state;
pub mod store;

pub use controller::{Controller, ControllerConfig};
pub use engine::{EngineConfig, ReconcileEngine, ReconcileOutcome};
pub use error::{ErrorKind, LifecycleError, LifecycleResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{OperatorMetrics, StructuredLogger};
pub use state::{DeploymentState, HealthState, Phase};
