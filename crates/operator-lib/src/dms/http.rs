//! REST client for an O2 DMS endpoint
//!
//! Errors are classified where they originate: timeouts and connection
//! failures become transient, 5xx responses become `Unavailable`, 404 maps
//! to `NotFound`, 409 to `AlreadyExists`, any other 4xx to `Rejected`.
//! Only transient errors are retried, with a doubling delay.

use super::{DmsClient, RemoteDeploymentStatus, RemoteState};
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::models::VnfIntent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// User agent sent with every request
pub const DEFAULT_USER_AGENT: &str = "O-RAN-MANO-VNF-Operator/1.0";

const DEPLOYMENTS_PATH: &str = "api/v1/deployments";

/// Longest error body excerpt kept in error messages
const MAX_ERROR_BODY: usize = 256;

/// HTTP DMS client configuration
#[derive(Debug, Clone)]
pub struct HttpDmsConfig {
    pub endpoint: String,
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries after the first attempt, transient failures only
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each later one
    pub retry_delay: Duration,
    pub user_agent: String,
}

impl Default for HttpDmsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8090".to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DeploymentRequest {
    name: String,
    #[serde(rename = "type")]
    vnf_type: String,
    version: String,
    target_clusters: Vec<String>,
    resources: WireResources,
    qos_profile: WireQos,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    config_data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct WireResources {
    cpu_cores: u32,
    memory_gb: u32,
}

#[derive(Debug, Serialize)]
struct WireQos {
    bandwidth: f64,
    latency: f64,
    jitter: f64,
}

impl DeploymentRequest {
    fn from_intent(intent: &VnfIntent) -> Self {
        let spec = &intent.spec;
        Self {
            name: intent.metadata.name.clone(),
            vnf_type: spec
                .vnf_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            version: spec.version.clone(),
            target_clusters: spec.target_sites.clone(),
            resources: WireResources {
                cpu_cores: spec.resources.cpu_cores,
                memory_gb: spec.resources.memory_gb,
            },
            qos_profile: WireQos {
                bandwidth: spec.qos.bandwidth_mbps,
                latency: spec.qos.latency_ms,
                jitter: spec.qos.jitter_ms,
            },
            config_data: spec.config.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    #[serde(default)]
    deployment_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    deployment_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    clusters: BTreeMap<String, String>,
    #[serde(default)]
    utilization: BTreeMap<String, f64>,
    #[serde(default)]
    qos: BTreeMap<String, f64>,
    #[serde(default)]
    last_update: Option<DateTime<Utc>>,
}

/// O2 DMS REST client
#[derive(Debug, Clone)]
pub struct HttpDmsClient {
    client: Client,
    base_url: Url,
    config: HttpDmsConfig,
}

impl HttpDmsClient {
    pub fn new(config: HttpDmsConfig) -> LifecycleResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| LifecycleError::internal(format!("failed to build HTTP client: {}", e)))?;

        // A trailing slash keeps any path prefix of the endpoint when joining
        let mut endpoint = config.endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base_url = Url::parse(&endpoint).map_err(|e| {
            LifecycleError::internal(format!("invalid DMS endpoint {:?}: {}", config.endpoint, e))
        })?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, deployment_id: Option<&str>) -> LifecycleResult<Url> {
        let path = match deployment_id {
            Some(id) => format!("{}/{}", DEPLOYMENTS_PATH, id),
            None => DEPLOYMENTS_PATH.to_string(),
        };
        self.base_url
            .join(&path)
            .map_err(|e| LifecycleError::internal(format!("invalid DMS path {}: {}", path, e)))
    }

    async fn send(
        &self,
        method: Method,
        deployment_id: Option<&str>,
        body: Option<&DeploymentRequest>,
    ) -> LifecycleResult<Response> {
        let url = self.url(deployment_id)?;
        debug!(method = %method, url = %url, "DMS request");

        let mut request = self.client.request(method, url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(classify_transport)
    }

    /// Run `op`, retrying transient failures with a doubling delay
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> LifecycleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == ErrorKind::TransientRemote && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self
                        .config
                        .retry_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "DMS call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_once(&self, body: &DeploymentRequest) -> LifecycleResult<String> {
        let response = self.send(Method::POST, None, Some(body)).await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            let text = response.text().await.unwrap_or_default();
            let existing_id = serde_json::from_str::<DeploymentResponse>(&text)
                .ok()
                .map(|r| r.deployment_id)
                .filter(|id| !id.is_empty());
            return Err(LifecycleError::AlreadyExists {
                resource: format!("deployment {}", body.name),
                existing_id,
            });
        }
        if !status.is_success() {
            return Err(classify_status(status, &body.name, response).await);
        }

        let parsed: DeploymentResponse = response
            .json()
            .await
            .map_err(|e| LifecycleError::Serialisation(e.to_string()))?;
        if parsed.deployment_id.is_empty() {
            return Err(LifecycleError::RemoteFailed(format!(
                "DMS accepted {} without a deployment id (status {:?}, message {:?})",
                body.name, parsed.status, parsed.message
            )));
        }
        Ok(parsed.deployment_id)
    }

    async fn status_once(&self, deployment_id: &str) -> LifecycleResult<RemoteDeploymentStatus> {
        let response = self.send(Method::GET, Some(deployment_id), None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, deployment_id, response).await);
        }

        let payload: StatusPayload = response
            .json()
            .await
            .map_err(|e| LifecycleError::Serialisation(e.to_string()))?;

        let id = if payload.deployment_id.is_empty() {
            deployment_id.to_string()
        } else {
            payload.deployment_id
        };
        Ok(RemoteDeploymentStatus {
            deployment_id: id,
            state: RemoteState::parse(&payload.status),
            message: payload.message,
            sites: payload
                .clusters
                .iter()
                .map(|(site, state)| (site.clone(), RemoteState::parse(state)))
                .collect(),
            utilization: payload.utilization,
            qos: payload.qos,
            last_update: payload.last_update,
        })
    }

    async fn update_once(&self, deployment_id: &str, body: &DeploymentRequest) -> LifecycleResult<()> {
        let response = self.send(Method::PUT, Some(deployment_id), Some(body)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, deployment_id, response).await);
        }
        Ok(())
    }

    async fn delete_once(&self, deployment_id: &str) -> LifecycleResult<()> {
        let response = self.send(Method::DELETE, Some(deployment_id), None).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(deployment_id, "Deployment already absent");
            return Ok(());
        }
        if !status.is_success() {
            return Err(classify_status(status, deployment_id, response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl DmsClient for HttpDmsClient {
    async fn create_deployment(&self, intent: &VnfIntent) -> LifecycleResult<String> {
        let body = DeploymentRequest::from_intent(intent);
        let body = &body;
        let id = self
            .with_retry("create", move || self.create_once(body))
            .await?;
        info!(vnf = %intent.key(), deployment_id = %id, "Created DMS deployment");
        Ok(id)
    }

    async fn get_deployment_status(
        &self,
        deployment_id: &str,
    ) -> LifecycleResult<RemoteDeploymentStatus> {
        self.with_retry("status", move || self.status_once(deployment_id))
            .await
    }

    async fn update_deployment(
        &self,
        deployment_id: &str,
        intent: &VnfIntent,
    ) -> LifecycleResult<()> {
        let body = DeploymentRequest::from_intent(intent);
        let body = &body;
        self.with_retry("update", move || self.update_once(deployment_id, body))
            .await?;
        info!(vnf = %intent.key(), deployment_id, "Updated DMS deployment");
        Ok(())
    }

    async fn delete_deployment(&self, deployment_id: &str) -> LifecycleResult<()> {
        self.with_retry("delete", move || self.delete_once(deployment_id))
            .await?;
        info!(deployment_id, "Deleted DMS deployment");
        Ok(())
    }
}

fn classify_transport(e: reqwest::Error) -> LifecycleError {
    if e.is_timeout() {
        LifecycleError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        LifecycleError::Unavailable(e.to_string())
    } else {
        LifecycleError::internal(format!("DMS transport error: {}", e))
    }
}

async fn classify_status(status: StatusCode, subject: &str, response: Response) -> LifecycleError {
    let message = error_message(response).await;
    match status {
        StatusCode::NOT_FOUND => LifecycleError::NotFound(format!("deployment {}", subject)),
        StatusCode::CONFLICT => LifecycleError::AlreadyExists {
            resource: format!("deployment {}", subject),
            existing_id: None,
        },
        s if s.is_server_error() => {
            LifecycleError::Unavailable(format!("HTTP {}: {}", s.as_u16(), message))
        }
        s => LifecycleError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// Best-effort human readable message from an error response body
async fn error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
        for field in ["message", "error"] {
            if let Some(msg) = value.get(field).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }
    text.chars().take(MAX_ERROR_BODY).collect()
}
