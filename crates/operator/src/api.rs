//! HTTP API for health checks, Prometheus metrics and VNF status

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use operator_lib::{
    engine::ReconcileEngine,
    error::{ErrorKind, LifecycleError},
    health::{ComponentStatus, HealthRegistry},
    models::{VnfIntent, VnfKey, VnfSpec},
    state::{DeploymentState, HealthState},
    store::{MemoryObjectStore, ObjectStore},
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub engine: Arc<ReconcileEngine>,
    pub store: Arc<MemoryObjectStore>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        engine: Arc<ReconcileEngine>,
        store: Arc<MemoryObjectStore>,
    ) -> Self {
        Self {
            health_registry,
            engine,
            store,
        }
    }
}

/// One row of `GET /api/v1/vnfs`
#[derive(Debug, Serialize)]
pub struct VnfListItem {
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    pub phase: String,
    pub health: HealthState,
    pub retry_count: u32,
    pub permanent_failure: bool,
    pub remote_deployment_id: String,
}

/// Body of `GET /api/v1/vnfs/{namespace}/{name}`
#[derive(Debug, Serialize)]
pub struct VnfDetail {
    pub intent: VnfIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DeploymentState>,
}

/// Lifecycle errors rendered as JSON
pub struct ApiError(LifecycleError);

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match (&self.0, self.0.kind()) {
            (LifecycleError::NotFound(_), _) => StatusCode::NOT_FOUND,
            (LifecycleError::Store(_), _) => StatusCode::CONFLICT,
            (_, ErrorKind::Validation) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health();

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness();

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_vnfs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<VnfListItem>>, ApiError> {
    let mut items = Vec::new();
    for key in state.store.list().await? {
        let intent = match state.store.get(&key).await {
            Ok(intent) => intent,
            // Removed between list and get
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        let summary = state.engine.status(&key).await.map(|s| s.summary());

        let phase = match &summary {
            Some(summary) => summary.phase.to_string(),
            None if !intent.status.phase.is_empty() => intent.status.phase.clone(),
            None => "Pending".to_string(),
        };
        items.push(VnfListItem {
            namespace: key.namespace,
            name: key.name,
            generation: intent.metadata.generation,
            phase,
            health: summary
                .as_ref()
                .map(|s| s.health)
                .unwrap_or(HealthState::Unknown),
            retry_count: intent.status.retry_count,
            permanent_failure: intent.status.permanent_failure,
            remote_deployment_id: intent.status.remote_deployment_id,
        });
    }
    Ok(Json(items))
}

async fn get_vnf(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<VnfDetail>, ApiError> {
    let key = VnfKey::new(namespace, name);
    let intent = state.store.get(&key).await?;
    let deployment = state.engine.status(&key).await;
    Ok(Json(VnfDetail {
        intent,
        state: deployment,
    }))
}

async fn apply_vnf(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<VnfSpec>,
) -> Result<Json<VnfIntent>, ApiError> {
    let key = VnfKey::new(namespace, name);
    let intent = state.store.apply(&key, spec)?;
    info!(vnf = %key, generation = intent.metadata.generation, "Intent applied via API");
    Ok(Json(intent))
}

async fn delete_vnf(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let key = VnfKey::new(namespace, name);
    state.store.request_deletion(&key)?;
    info!(vnf = %key, "Deletion requested via API");
    Ok(StatusCode::ACCEPTED)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/vnfs", get(list_vnfs))
        .route(
            "/api/v1/vnfs/:namespace/:name",
            get(get_vnf).put(apply_vnf).delete(delete_vnf),
        )
        .with_state(state)
}

/// Start the API server, stopping when `shutdown` is cancelled
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
