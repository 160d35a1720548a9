//! Observability infrastructure for the detection service
//!
//! Provides:
//! - Prometheus metrics (cycle latency, cycle outcomes, anomalies, deployed models)
//! - Structured JSON logging with tracing

use crate::models::Anomaly;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for cycle latency (in seconds)
const CYCLE_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    cycle_latency_seconds: Histogram,
    cycles_completed: IntCounter,
    cycles_failed: IntCounter,
    cycles_skipped: IntCounter,
    anomalies_detected: IntCounterVec,
    agents_active: IntGauge,
    deployed_model_info: GaugeVec,
    model_operations: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "netsentry_cycle_latency_seconds",
                "Time spent in one analysis cycle (fetch, extract, classify, persist)",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            cycles_completed: register_int_counter!(
                "netsentry_cycles_completed_total",
                "Analysis cycles that ran to completion"
            )
            .expect("Failed to register cycles_completed"),

            cycles_failed: register_int_counter!(
                "netsentry_cycles_failed_total",
                "Analysis cycles that ended in an error"
            )
            .expect("Failed to register cycles_failed"),

            cycles_skipped: register_int_counter!(
                "netsentry_cycles_skipped_total",
                "Analysis ticks skipped because a cycle was still running or the agent was stopped"
            )
            .expect("Failed to register cycles_skipped"),

            anomalies_detected: register_int_counter_vec!(
                "netsentry_anomalies_detected_total",
                "Anomalies detected, by detection method",
                &["method"]
            )
            .expect("Failed to register anomalies_detected"),

            agents_active: register_int_gauge!(
                "netsentry_agents_active",
                "Number of started agents"
            )
            .expect("Failed to register agents_active"),

            deployed_model_info: register_gauge_vec!(
                "netsentry_deployed_model_info",
                "Currently deployed model version per slot",
                &["slot", "version"]
            )
            .expect("Failed to register deployed_model_info"),

            model_operations: register_int_counter_vec!(
                "netsentry_model_operations_total",
                "Model lifecycle operations, by operation and result",
                &["operation", "result"]
            )
            .expect("Failed to register model_operations"),
        }
    }
}

/// Metrics handle for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cycles_completed(&self) {
        self.inner().cycles_completed.inc();
    }

    pub fn inc_cycles_failed(&self) {
        self.inner().cycles_failed.inc();
    }

    pub fn inc_cycles_skipped(&self) {
        self.inner().cycles_skipped.inc();
    }

    pub fn inc_anomalies_detected(&self, method: &str) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[method])
            .inc();
    }

    pub fn set_agents_active(&self, count: i64) {
        self.inner().agents_active.set(count);
    }

    /// Point a slot at a new deployed version, clearing the previous one
    pub fn set_deployed_model(&self, slot: &str, previous: Option<&str>, version: &str) {
        let info = &self.inner().deployed_model_info;
        if let Some(prev) = previous {
            let _ = info.remove_label_values(&[slot, prev]);
        }
        info.with_label_values(&[slot, version]).set(1.0);
    }

    pub fn record_model_operation(&self, operation: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.inner()
            .model_operations
            .with_label_values(&[operation, result])
            .inc();
    }
}

/// Structured logger for service events
///
/// Consistent JSON-formatted events for anomalies, cycles, model
/// lifecycle changes and agent status changes.
#[derive(Clone)]
pub struct StructuredLogger {
    service: String,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Log an anomaly handed to the sink
    pub fn log_anomaly(&self, anomaly: &Anomaly) {
        if anomaly.severity >= 4 {
            warn!(
                event = "anomaly_detected",
                service = %self.service,
                agent_id = %anomaly.source_agent_id,
                entity_id = %anomaly.entity_id,
                anomaly_type = %anomaly.anomaly_type,
                severity = anomaly.severity,
                confidence = anomaly.confidence,
                detection_method = %anomaly.detection_method,
                model_version = ?anomaly.model_version,
                "High severity anomaly detected"
            );
        } else {
            info!(
                event = "anomaly_detected",
                service = %self.service,
                agent_id = %anomaly.source_agent_id,
                entity_id = %anomaly.entity_id,
                anomaly_type = %anomaly.anomaly_type,
                severity = anomaly.severity,
                confidence = anomaly.confidence,
                detection_method = %anomaly.detection_method,
                model_version = ?anomaly.model_version,
                "Anomaly detected"
            );
        }
    }

    pub fn log_cycle_completed(
        &self,
        agent_id: &str,
        entities: usize,
        anomalies: usize,
        elapsed_ms: u128,
    ) {
        info!(
            event = "cycle_completed",
            service = %self.service,
            agent_id = %agent_id,
            entities = entities,
            anomalies = anomalies,
            elapsed_ms = elapsed_ms,
            "Analysis cycle completed"
        );
    }

    pub fn log_cycle_failed(&self, agent_id: &str, reason: &str) {
        error!(
            event = "cycle_failed",
            service = %self.service,
            agent_id = %agent_id,
            error = %reason,
            "Analysis cycle failed"
        );
    }

    pub fn log_agent_status(&self, agent_id: &str, from: &str, to: &str, reason: Option<&str>) {
        info!(
            event = "agent_status_changed",
            service = %self.service,
            agent_id = %agent_id,
            from = %from,
            to = %to,
            reason = ?reason,
            "Agent status changed"
        );
    }

    pub fn log_model_imported(&self, version: &str, slot: &str, is_valid: bool, warnings: usize) {
        info!(
            event = "model_imported",
            service = %self.service,
            version = %version,
            slot = %slot,
            is_valid = is_valid,
            warnings = warnings,
            "Model bundle imported"
        );
    }

    pub fn log_model_deployed(&self, slot: &str, previous: Option<&str>, version: &str) {
        info!(
            event = "model_deployed",
            service = %self.service,
            slot = %slot,
            previous_version = ?previous,
            version = %version,
            "Model version deployed"
        );
    }

    pub fn log_model_rolled_back(&self, slot: &str, previous: Option<&str>, version: &str) {
        warn!(
            event = "model_rolled_back",
            service = %self.service,
            slot = %slot,
            previous_version = ?previous,
            version = %version,
            "Model version rolled back"
        );
    }

    pub fn log_model_deleted(&self, version: &str) {
        info!(
            event = "model_deleted",
            service = %self.service,
            version = %version,
            "Model version deleted"
        );
    }

    pub fn log_startup(&self, version: &str, agents: usize) {
        info!(
            event = "service_started",
            service = %self.service,
            service_version = %version,
            agents = agents,
            "Detection service started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            service = %self.service,
            reason = %reason,
            "Detection service shutting down"
        );
    }
}
