//! Observability infrastructure for the analytics pipeline
//!
//! Provides:
//! - Prometheus metrics (ingestion, storage latency, graph size, anomalies)
//! - Structured JSON logging of domain events with tracing

use crate::anomaly::{Anomaly, Severity};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for storage write latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    events_received: IntCounter,
    events_dropped: IntCounter,
    events_stored: IntCounter,
    events_without_identity: IntCounter,
    batches_written: IntCounter,
    storage_errors: IntCounter,
    storage_latency_seconds: Histogram,
    flows_aggregated: IntCounter,
    graph_nodes: IntGauge,
    graph_edges: IntGauge,
    baselines: IntGauge,
    anomalies_detected: IntCounterVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            events_received: register_int_counter!(
                "flowscope_events_received_total",
                "Transfer events offered to the ingestion queue, dropped ones included"
            )
            .expect("Failed to register events_received"),

            events_dropped: register_int_counter!(
                "flowscope_events_dropped_total",
                "Transfer events dropped because the ingestion queue was full"
            )
            .expect("Failed to register events_dropped"),

            events_stored: register_int_counter!(
                "flowscope_events_stored_total",
                "Transfer events written to durable storage"
            )
            .expect("Failed to register events_stored"),

            events_without_identity: register_int_counter!(
                "flowscope_events_without_identity_total",
                "Events skipped by flow aggregation for lack of a source identity"
            )
            .expect("Failed to register events_without_identity"),

            batches_written: register_int_counter!(
                "flowscope_batches_written_total",
                "Event batches written to durable storage"
            )
            .expect("Failed to register batches_written"),

            storage_errors: register_int_counter!(
                "flowscope_storage_errors_total",
                "Event batches discarded after a storage failure"
            )
            .expect("Failed to register storage_errors"),

            storage_latency_seconds: register_histogram!(
                "flowscope_storage_latency_seconds",
                "Time spent writing one event batch",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register storage_latency_seconds"),

            flows_aggregated: register_int_counter!(
                "flowscope_flows_aggregated_total",
                "Flows produced by batch aggregation"
            )
            .expect("Failed to register flows_aggregated"),

            graph_nodes: register_int_gauge!(
                "flowscope_graph_nodes",
                "Nodes in the transfer graph, external nodes included"
            )
            .expect("Failed to register graph_nodes"),

            graph_edges: register_int_gauge!(
                "flowscope_graph_edges",
                "Edges in the transfer graph"
            )
            .expect("Failed to register graph_edges"),

            baselines: register_int_gauge!(
                "flowscope_baselines",
                "Flow keys with a trained baseline"
            )
            .expect("Failed to register baselines"),

            anomalies_detected: register_int_counter_vec!(
                "flowscope_anomalies_detected_total",
                "Anomalies recorded by the detection loop",
                &["type", "severity"]
            )
            .expect("Failed to register anomalies_detected"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn inc_events_received(&self, n: u64) {
        self.inner().events_received.inc_by(n);
    }

    pub fn inc_events_dropped(&self, n: u64) {
        self.inner().events_dropped.inc_by(n);
    }

    pub fn inc_events_without_identity(&self, n: u64) {
        self.inner().events_without_identity.inc_by(n);
    }

    pub fn inc_flows_aggregated(&self, n: u64) {
        self.inner().flows_aggregated.inc_by(n);
    }

    /// Record a successful batch write
    pub fn record_batch_written(&self, events: u64, duration_secs: f64) {
        let inner = self.inner();
        inner.batches_written.inc();
        inner.events_stored.inc_by(events);
        inner.storage_latency_seconds.observe(duration_secs);
    }

    pub fn record_storage_error(&self, duration_secs: f64) {
        let inner = self.inner();
        inner.storage_errors.inc();
        inner.storage_latency_seconds.observe(duration_secs);
    }

    pub fn set_graph_size(&self, nodes: usize, edges: usize) {
        self.inner().graph_nodes.set(nodes as i64);
        self.inner().graph_edges.set(edges as i64);
    }

    pub fn set_baselines(&self, count: usize) {
        self.inner().baselines.set(count as i64);
    }

    pub fn inc_anomalies_detected(&self, anomaly: &Anomaly) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[anomaly.anomaly_type.as_str(), anomaly.severity.as_str()])
            .inc();
    }

    pub fn events_received(&self) -> u64 {
        self.inner().events_received.get()
    }

    pub fn events_dropped(&self) -> u64 {
        self.inner().events_dropped.get()
    }

    pub fn events_stored(&self) -> u64 {
        self.inner().events_stored.get()
    }

    pub fn batches_written(&self) -> u64 {
        self.inner().batches_written.get()
    }

    pub fn storage_errors(&self) -> u64 {
        self.inner().storage_errors.get()
    }
}

/// Structured logger for pipeline domain events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_batch_flushed(&self, events: usize, flows: usize, stored: bool, elapsed_ms: u128) {
        info!(
            event = "batch_flushed",
            instance = %self.instance,
            events = events,
            flows = flows,
            stored = stored,
            elapsed_ms = elapsed_ms,
            "Event batch flushed"
        );
    }

    pub fn log_storage_failure(&self, events: usize, error: &dyn std::error::Error) {
        error!(
            event = "storage_failed",
            instance = %self.instance,
            events = events,
            error = %error,
            "Failed to store event batch, batch discarded"
        );
    }

    pub fn log_events_dropped(&self, dropped: usize, queue_capacity: usize) {
        warn!(
            event = "events_dropped",
            instance = %self.instance,
            dropped = dropped,
            queue_capacity = queue_capacity,
            "Ingestion queue full, events dropped"
        );
    }

    pub fn log_anomaly_detected(&self, anomaly: &Anomaly) {
        match anomaly.severity {
            Severity::Critical | Severity::High => {
                warn!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    anomaly_id = %anomaly.id,
                    anomaly_type = %anomaly.anomaly_type,
                    severity = %anomaly.severity,
                    flow = %anomaly.flow_key,
                    current_value = anomaly.current_value,
                    baseline_value = anomaly.baseline_value,
                    deviation = anomaly.deviation,
                    monthly_impact_usd = anomaly.estimated_monthly_impact_usd,
                    "Severe transfer anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    anomaly_id = %anomaly.id,
                    anomaly_type = %anomaly.anomaly_type,
                    severity = %anomaly.severity,
                    flow = %anomaly.flow_key,
                    current_value = anomaly.current_value,
                    baseline_value = anomaly.baseline_value,
                    deviation = anomaly.deviation,
                    "Transfer anomaly detected"
                );
            }
        }
    }

    pub fn log_baselines_trained(&self, built: usize, keys_seen: usize, lookback_hours: u32) {
        info!(
            event = "baseline_built",
            instance = %self.instance,
            built = built,
            keys_seen = keys_seen,
            lookback_hours = lookback_hours,
            "Baselines trained from stored flows"
        );
    }

    pub fn log_startup(&self, version: &str, api_port: u16) {
        info!(
            event = "service_started",
            instance = %self.instance,
            version = %version,
            api_port = api_port,
            "FlowScope started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            instance = %self.instance,
            reason = %reason,
            "FlowScope shutting down"
        );
    }
}
