//! Operator configuration

use anyhow::{Context, Result};
use operator_lib::{
    allocator::SiteQuota,
    controller::ControllerConfig,
    dms::HttpDmsConfig,
    engine::EngineConfig,
    monitor::MonitorConfig,
    retry::BackoffPolicy,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "VNF_OPERATOR_CONFIG";

/// Prefix of environment overrides, e.g. `VNF_OPERATOR_API_PORT`
pub const ENV_PREFIX: &str = "VNF_OPERATOR";

/// Operator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Name used in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// O2 DMS base URL; unset runs against the in-memory DMS
    #[serde(default)]
    pub dms_endpoint: Option<String>,

    #[serde(default)]
    pub dms_token: Option<String>,

    #[serde(default = "default_dms_timeout")]
    pub dms_timeout_secs: u64,

    #[serde(default = "default_dms_max_retries")]
    pub dms_max_retries: u32,

    /// Root directory for pushed packages; unset disables the push
    #[serde(default)]
    pub gitops_dir: Option<String>,

    #[serde(default)]
    pub gate_deploy_on_push: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_running_poll_interval")]
    pub running_poll_interval_secs: u64,

    #[serde(default = "default_deploy_settle")]
    pub deploy_settle_secs: u64,

    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    /// Per-site capacity; sites not listed are unbounded
    #[serde(default)]
    pub site_quotas: HashMap<String, SiteQuota>,
}

fn default_instance_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "vnf-operator".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_dms_timeout() -> u64 {
    30
}

fn default_dms_max_retries() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    30
}

fn default_max_backoff() -> u64 {
    600
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retryable_errors() -> Vec<String> {
    vec![
        "timeout".to_string(),
        "connection".to_string(),
        "temporary".to_string(),
    ]
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_running_poll_interval() -> u64 {
    300
}

fn default_deploy_settle() -> u64 {
    30
}

fn default_resync_interval() -> u64 {
    60
}

fn default_max_concurrent_reconciles() -> usize {
    10
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            dms_endpoint: None,
            dms_token: None,
            dms_timeout_secs: default_dms_timeout(),
            dms_max_retries: default_dms_max_retries(),
            gitops_dir: None,
            gate_deploy_on_push: false,
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_errors: default_retryable_errors(),
            health_check_interval_secs: default_health_check_interval(),
            running_poll_interval_secs: default_running_poll_interval(),
            deploy_settle_secs: default_deploy_settle(),
            resync_interval_secs: default_resync_interval(),
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
            site_quotas: HashMap::new(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the file named by `VNF_OPERATOR_CONFIG`, if
    /// any, overridden by `VNF_OPERATOR_*` environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("retryable_errors")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to read operator configuration")?;
        let config: OperatorConfig = config
            .try_deserialize()
            .context("Invalid operator configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            anyhow::bail!("max_concurrent_reconciles must be at least 1");
        }
        if self.backoff_multiplier < 1.0 {
            anyhow::bail!("backoff_multiplier must be at least 1.0");
        }
        if self.initial_backoff_secs > self.max_backoff_secs {
            anyhow::bail!("initial_backoff_secs must not exceed max_backoff_secs");
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_backoff: Duration::from_secs(self.initial_backoff_secs),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            backoff: self.backoff(),
            retryable_errors: self.retryable_errors.clone(),
            running_poll_interval: Duration::from_secs(self.running_poll_interval_secs),
            deploy_settle: Duration::from_secs(self.deploy_settle_secs),
            gate_deploy_on_push: self.gate_deploy_on_push,
            monitor: MonitorConfig {
                interval: Duration::from_secs(self.health_check_interval_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
        }
    }

    /// HTTP DMS settings, if an endpoint is configured
    pub fn dms_config(&self) -> Option<HttpDmsConfig> {
        let endpoint = self.dms_endpoint.as_ref().filter(|e| !e.trim().is_empty())?;
        Some(HttpDmsConfig {
            endpoint: endpoint.clone(),
            token: self.dms_token.clone(),
            timeout: Duration::from_secs(self.dms_timeout_secs),
            max_retries: self.dms_max_retries,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.max_retries, 5);
        assert!(config.dms_config().is_none());

        let engine = config.engine_config();
        assert_eq!(engine.backoff.delay(0), Duration::from_secs(30));
        assert_eq!(engine.backoff.delay(10), Duration::from_secs(600));
        assert_eq!(engine.running_poll_interval, Duration::from_secs(300));
        assert_eq!(config.controller_config().max_concurrent_reconciles, 10);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
api_port = 9090
dms_endpoint = "http://o2-dms:8080"
max_retries = 2
gate_deploy_on_push = true

[site_quotas.edge-01]
cpu_cores = 16
memory_gb = 64
storage_gb = 128
bandwidth_mbps = 1000.0
"#
        )
        .unwrap();

        let config = assert_ok!(OperatorConfig::load_from(Some(file.path())));
        assert_eq!(config.api_port, 9090);
        assert_eq!(config.max_retries, 2);
        assert!(config.gate_deploy_on_push);
        assert_eq!(config.site_quotas["edge-01"].cpu_cores, 16);
        assert_eq!(
            config.dms_config().unwrap().endpoint,
            "http://o2-dms:8080"
        );
        // Untouched fields keep their defaults
        assert_eq!(config.deploy_settle_secs, 30);
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "initial_backoff_secs = 900\nmax_backoff_secs = 600").unwrap();
        assert_err!(OperatorConfig::load_from(Some(file.path())));
    }
}
