//! Observability infrastructure for the VNF operator
//!
//! Provides:
//! - Prometheus metrics (reconcile latency and outcomes, failures, monitors)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for reconcile pass duration (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<OperatorMetricsInner> = OnceLock::new();

struct OperatorMetricsInner {
    reconcile_duration_seconds: Histogram,
    reconciles_total: IntCounterVec,
    phase_failures_total: IntCounterVec,
    permanent_failures_total: IntCounter,
    remediations_total: IntCounterVec,
    managed_vnfs: IntGauge,
    active_monitors: IntGauge,
    allocated_cores: IntGauge,
}

impl OperatorMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "vnf_operator_reconcile_duration_seconds",
                "Time spent in one reconcile pass",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            reconciles_total: register_int_counter_vec!(
                "vnf_operator_reconciles_total",
                "Reconcile passes by outcome",
                &["result"]
            )
            .expect("Failed to register reconciles_total"),

            phase_failures_total: register_int_counter_vec!(
                "vnf_operator_phase_failures_total",
                "Phase handler failures by phase",
                &["phase"]
            )
            .expect("Failed to register phase_failures_total"),

            permanent_failures_total: register_int_counter!(
                "vnf_operator_permanent_failures_total",
                "VNFs marked permanently failed after exhausting retries"
            )
            .expect("Failed to register permanent_failures_total"),

            remediations_total: register_int_counter_vec!(
                "vnf_operator_remediations_total",
                "Automated remediation attempts by action and outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register remediations_total"),

            managed_vnfs: register_int_gauge!(
                "vnf_operator_managed_vnfs",
                "Number of VNFs with in-memory deployment state"
            )
            .expect("Failed to register managed_vnfs"),

            active_monitors: register_int_gauge!(
                "vnf_operator_active_monitors",
                "Number of running health monitor tasks"
            )
            .expect("Failed to register active_monitors"),

            allocated_cores: register_int_gauge!(
                "vnf_operator_allocated_cores",
                "CPU cores currently reserved across all sites"
            )
            .expect("Failed to register allocated_cores"),
        }
    }
}

/// Reconcile pass outcome label values
pub mod results {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const DEFERRED: &str = "deferred";
    pub const CANCELLED: &str = "cancelled";
}

/// Operator metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct OperatorMetrics {
    _private: (),
}

impl Default for OperatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperatorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorMetrics").finish()
    }
}

impl OperatorMetrics {
    /// Create a new metrics handle (registers the global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &OperatorMetricsInner {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new)
    }

    pub fn observe_reconcile(&self, duration_secs: f64, result: &str) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
        self.inner()
            .reconciles_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_phase_failure(&self, phase: &str) {
        self.inner()
            .phase_failures_total
            .with_label_values(&[phase])
            .inc();
    }

    pub fn inc_permanent_failures(&self) {
        self.inner().permanent_failures_total.inc();
    }

    pub fn inc_remediation(&self, action: &str, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failure" };
        self.inner()
            .remediations_total
            .with_label_values(&[action, outcome])
            .inc();
    }

    pub fn set_managed_vnfs(&self, count: i64) {
        self.inner().managed_vnfs.set(count);
    }

    pub fn set_active_monitors(&self, count: i64) {
        self.inner().active_monitors.set(count);
    }

    pub fn set_allocated_cores(&self, cores: i64) {
        self.inner().allocated_cores.set(cores);
    }
}

/// Structured logger for lifecycle events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, dms_endpoint: &str) {
        info!(
            event = "operator_started",
            instance = %self.instance,
            operator_version = %version,
            dms_endpoint = %dms_endpoint,
            "VNF operator started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "operator_shutdown",
            instance = %self.instance,
            reason = %reason,
            "VNF operator shutting down"
        );
    }

    pub fn log_phase_transition(&self, vnf: &str, from: &str, to: &str) {
        info!(
            event = "phase_transition",
            instance = %self.instance,
            vnf = %vnf,
            from = %from,
            to = %to,
            "Phase transition"
        );
    }

    pub fn log_phase_failed(&self, vnf: &str, phase: &str, code: &str, recoverable: bool, error: &str) {
        warn!(
            event = "phase_failed",
            instance = %self.instance,
            vnf = %vnf,
            phase = %phase,
            code = %code,
            recoverable = recoverable,
            error = %error,
            "Phase failed"
        );
    }

    pub fn log_permanent_failure(&self, vnf: &str, retries: u32, root_cause: &str) {
        warn!(
            event = "permanent_failure",
            instance = %self.instance,
            vnf = %vnf,
            retries = retries,
            root_cause = %root_cause,
            "VNF permanently failed, waiting for a spec change"
        );
    }

    pub fn log_remediation(&self, vnf: &str, action: &str, success: bool) {
        if success {
            info!(
                event = "remediation_attempted",
                instance = %self.instance,
                vnf = %vnf,
                action = %action,
                success = true,
                "Remediation applied"
            );
        } else {
            warn!(
                event = "remediation_attempted",
                instance = %self.instance,
                vnf = %vnf,
                action = %action,
                success = false,
                "Remediation failed"
            );
        }
    }

    pub fn log_terminated(&self, vnf: &str, remote_deleted: bool) {
        info!(
            event = "vnf_terminated",
            instance = %self.instance,
            vnf = %vnf,
            remote_deleted = remote_deleted,
            "VNF terminated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_metrics_creation() {
        // Metrics live in the global registry, so handles created by other
        // tests in this process share them.
        let metrics = OperatorMetrics::new();
        metrics.observe_reconcile(0.01, results::SUCCESS);
        metrics.inc_phase_failure("Deploying");
        metrics.inc_permanent_failures();
        metrics.inc_remediation("retry_pipeline", true);
        metrics.set_managed_vnfs(3);
        metrics.set_active_monitors(2);
        metrics.set_allocated_cores(8);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "vnf_operator_reconciles_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("operator-0");
        assert_eq!(logger.instance, "operator-0");
    }
}
