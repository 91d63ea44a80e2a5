//! Deployment Management Service (DMS) client contract
//!
//! The engine talks to the remote DMS only through [`DmsClient`]. Two
//! implementations ship with the crate:
//! - `HttpDmsClient`: REST client for an O2 DMS endpoint
//! - `MemoryDmsClient`: in-process fake with fault injection

mod http;
mod memory;

pub use http::{HttpDmsClient, HttpDmsConfig, DEFAULT_USER_AGENT};
pub use memory::{DmsOperation, MemoryDmsClient};

use crate::error::LifecycleResult;
use crate::models::VnfIntent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// State of a remote deployment as reported by the DMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteState {
    Creating,
    Running,
    Updating,
    Failed,
    Deleting,
    Unknown,
}

impl RemoteState {
    /// Parse the DMS status string; anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "creating" | "pending" => RemoteState::Creating,
            "running" | "ready" => RemoteState::Running,
            "updating" => RemoteState::Updating,
            "failed" | "error" => RemoteState::Failed,
            "deleting" | "terminating" => RemoteState::Deleting,
            _ => RemoteState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteState::Creating => "Creating",
            RemoteState::Running => "Running",
            RemoteState::Updating => "Updating",
            RemoteState::Failed => "Failed",
            RemoteState::Deleting => "Deleting",
            RemoteState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one remote deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteDeploymentStatus {
    pub deployment_id: String,
    pub state: RemoteState,
    pub message: Option<String>,
    /// Per-site state, keyed by site name
    pub sites: BTreeMap<String, RemoteState>,
    pub utilization: BTreeMap<String, f64>,
    pub qos: BTreeMap<String, f64>,
    pub last_update: Option<DateTime<Utc>>,
}

impl RemoteDeploymentStatus {
    pub fn new(deployment_id: impl Into<String>, state: RemoteState) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            state,
            message: None,
            sites: BTreeMap::new(),
            utilization: BTreeMap::new(),
            qos: BTreeMap::new(),
            last_update: None,
        }
    }
}

/// Remote deployment operations. All four are safe to retry.
#[async_trait]
pub trait DmsClient: Send + Sync {
    /// Create a deployment and return its remote identifier
    async fn create_deployment(&self, intent: &VnfIntent) -> LifecycleResult<String>;

    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> LifecycleResult<RemoteDeploymentStatus>;

    async fn update_deployment(&self, deployment_id: &str, intent: &VnfIntent)
        -> LifecycleResult<()>;

    /// Delete a deployment. A deployment that does not exist is not an error.
    async fn delete_deployment(&self, deployment_id: &str) -> LifecycleResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_state_parsing() {
        assert_eq!(RemoteState::parse("Running"), RemoteState::Running);
        assert_eq!(RemoteState::parse("FAILED"), RemoteState::Failed);
        assert_eq!(RemoteState::parse("creating"), RemoteState::Creating);
        assert_eq!(RemoteState::parse("Terminating"), RemoteState::Deleting);
        assert_eq!(RemoteState::parse("sideways"), RemoteState::Unknown);
    }
}
