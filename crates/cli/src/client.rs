//! API client for communicating with the operator API

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the operator's HTTP API
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let response = check(response).await?;
        response.json().await.context("Failed to parse response")
    }

    /// Make a PUT request with JSON body
    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .put(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        let response = check(response).await?;
        response.json().await.context("Failed to parse response")
    }

    /// Make a DELETE request, ignoring any response body
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .context("Failed to send request")?;

        check(response).await?;
        Ok(())
    }

    pub async fn list_vnfs(&self) -> Result<Vec<VnfListItem>> {
        self.get("api/v1/vnfs").await
    }

    pub async fn get_vnf(&self, vnf: &VnfRef) -> Result<VnfDetail> {
        self.get(&vnf.path()).await
    }

    pub async fn apply_vnf(&self, vnf: &VnfRef, spec: &serde_json::Value) -> Result<Intent> {
        self.put(&vnf.path(), spec).await
    }

    pub async fn delete_vnf(&self, vnf: &VnfRef) -> Result<()> {
        self.delete(&vnf.path()).await
    }

    /// Operator health; a 503 still carries a health body
    pub async fn health(&self) -> Result<OperatorHealth> {
        let url = self.base_url.join("healthz").context("Invalid path")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;
        response.json().await.context("Failed to parse response")
    }
}

/// Turn a non-2xx response into an error carrying the API's message
async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => anyhow::bail!("API error ({}): {}", status, err.error),
        Err(_) => anyhow::bail!("API error ({}): {}", status, body),
    }
}

/// A `namespace/name` VNF reference; a bare name uses the default namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnfRef {
    pub namespace: String,
    pub name: String,
}

impl VnfRef {
    pub fn parse(s: &str, default_namespace: &str) -> Result<Self> {
        let (namespace, name) = match s.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (default_namespace, s),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            anyhow::bail!("Invalid VNF reference '{}', expected namespace/name", s);
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    fn path(&self) -> String {
        format!("api/v1/vnfs/{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for VnfRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnfListItem {
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    pub phase: String,
    pub health: String,
    pub retry_count: u32,
    pub permanent_failure: bool,
    pub remote_deployment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnfDetail {
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeploymentState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub metadata: Metadata,
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: IntentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    #[serde(default)]
    pub deletion_requested: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub remote_deployment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub permanent_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub phase: String,
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<String>,
    #[serde(default)]
    pub permanently_failed: bool,
    pub health: VnfHealth,
    #[serde(default)]
    pub remote_deployment_id: String,
    #[serde(default)]
    pub gitops_revision: Option<String>,
    #[serde(default)]
    pub error_history: Vec<ErrorEntry>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnfHealth {
    pub overall: String,
    #[serde(default)]
    pub per_component: BTreeMap<String, String>,
    #[serde(default)]
    pub last_check: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: String,
    pub phase: String,
    pub message: String,
    pub code: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorHealth {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vnf_ref_parsing() {
        let r = VnfRef::parse("core/upf-1", "default").unwrap();
        assert_eq!(r.namespace, "core");
        assert_eq!(r.name, "upf-1");

        let r = VnfRef::parse("ran-1", "edge").unwrap();
        assert_eq!(r.to_string(), "edge/ran-1");

        assert!(VnfRef::parse("core/", "default").is_err());
        assert!(VnfRef::parse("/upf", "default").is_err());
        assert!(VnfRef::parse("a/b/c", "default").is_err());
    }

    #[tokio::test]
    async fn test_list_vnfs() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/vnfs")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"namespace":"core","name":"upf-1","generation":2,"phase":"Running",
                    "health":"healthy","retry_count":0,"permanent_failure":false,
                    "remote_deployment_id":"dms-upf-1-UPF"}]"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let items = client.list_vnfs().await.unwrap();

        mock.assert_async().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].phase, "Running");
        assert_eq!(items[0].remote_deployment_id, "dms-upf-1-UPF");
    }

    #[tokio::test]
    async fn test_get_vnf_with_state() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/vnfs/core/upf-1")
            .with_status(200)
            .with_body(
                r#"{"intent":{"metadata":{"namespace":"core","name":"upf-1","generation":1,
                    "finalizers":["vnf.mano.oran.io/finalizer"],"deletion_requested":false},
                    "spec":{"type":"UPF"},"status":{"phase":"Failed","retry_count":2}},
                    "state":{"phase":"Failed","retry_count":2,"permanently_failed":false,
                    "health":{"overall":"unknown","per_component":{},"last_check":null,"errors":[]},
                    "remote_deployment_id":"","error_history":[{"timestamp":"2026-01-01T00:00:00Z",
                    "phase":"Deploying","message":"DMS unavailable","code":"unavailable",
                    "kind":"TransientRemote","severity":"medium","recoverable":true}],
                    "events":[]}}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let vnf = VnfRef::parse("core/upf-1", "default").unwrap();
        let detail = client.get_vnf(&vnf).await.unwrap();

        assert_eq!(detail.intent.status.retry_count, 2);
        let state = detail.state.unwrap();
        assert_eq!(state.error_history[0].code, "unavailable");
        assert_eq!(state.health.overall, "unknown");
    }

    #[tokio::test]
    async fn test_api_error_message_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/vnfs/core/missing")
            .with_status(404)
            .with_body(r#"{"error":"not found: VNF core/missing","code":"not_found"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let vnf = VnfRef::parse("core/missing", "default").unwrap();
        let err = client.get_vnf(&vnf).await.unwrap_err().to_string();

        assert!(err.contains("404"));
        assert!(err.contains("VNF core/missing"));
    }

    #[test]
    fn test_delete_vnf() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("DELETE", "/api/v1/vnfs/core/upf-1")
            .with_status(202)
            .create();

        let client = ApiClient::new(&server.url()).unwrap();
        let vnf = VnfRef::parse("core/upf-1", "default").unwrap();
        tokio_test::block_on(client.delete_vnf(&vnf)).unwrap();

        mock.assert();
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
