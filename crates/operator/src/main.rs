//! VNF Operator - lifecycle reconciliation for O-RAN VNFs
//!
//! Runs the controller loop that drives every declared VNF through its
//! lifecycle and serves health, metrics and status over HTTP.

use anyhow::{Context, Result};
use operator_lib::{
    allocator::QuotaAllocator,
    controller::Controller,
    dms::{DmsClient, HttpDmsClient, MemoryDmsClient},
    engine::ReconcileEngine,
    gitops::DirectoryGitOps,
    health::{components, HealthRegistry},
    observability::{OperatorMetrics, StructuredLogger},
    store::MemoryObjectStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vnf_operator::{api, config::OperatorConfig};

const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting vnf-operator");

    let config = OperatorConfig::load()?;
    info!(instance = %config.instance_name, api_port = config.api_port, "Operator configured");

    let health_registry = HealthRegistry::for_operator();

    // Register metrics before the first scrape
    let _metrics = OperatorMetrics::new();

    let logger = StructuredLogger::new(&config.instance_name);

    let store = Arc::new(MemoryObjectStore::new());
    let (dms, dms_endpoint): (Arc<dyn DmsClient>, String) = match config.dms_config() {
        Some(dms_config) => {
            let endpoint = dms_config.endpoint.clone();
            let client = HttpDmsClient::new(dms_config).context("Failed to create DMS client")?;
            (Arc::new(client), endpoint)
        }
        None => {
            warn!("No DMS endpoint configured, deployments go to the in-memory DMS");
            health_registry.set_degraded(components::DMS, "in-memory DMS");
            (Arc::new(MemoryDmsClient::new()), "memory".to_string())
        }
    };
    logger.log_startup(OPERATOR_VERSION, &dms_endpoint);

    let mut builder = ReconcileEngine::builder()
        .store(store.clone())
        .dms(dms)
        .allocator(Arc::new(QuotaAllocator::with_quotas(config.site_quotas.clone())))
        .config(config.engine_config())
        .logger(logger.clone());
    if let Some(dir) = &config.gitops_dir {
        info!(dir = %dir, "Pushing packages to GitOps directory");
        builder = builder.gitops(Arc::new(DirectoryGitOps::new(dir)));
    }
    let engine = Arc::new(builder.build().context("Failed to build reconcile engine")?);

    let shutdown = CancellationToken::new();

    // Readiness is raised by the controller once its first listing succeeds
    let controller = Controller::new(Arc::clone(&engine), config.controller_config())
        .with_health(health_registry.clone());
    let changes = store.subscribe();
    let controller_handle = {
        let shutdown = shutdown.clone();
        let registry = health_registry.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.run(changes, shutdown).await {
                error!(error = %e, "Controller exited with error");
                registry.set_unhealthy(components::CONTROLLER, e.to_string());
            }
        })
    };

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        Arc::clone(&engine),
        store,
    ));

    // Start health, metrics and status server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false);
    shutdown.cancel();

    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task panicked");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
