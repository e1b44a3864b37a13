// crates/engine/src/metrics.rs
//! Engine metrics for Prometheus monitoring.
//!
//! The orchestrator pushes per-computation latencies and sizes here; the
//! storage gateway and the worker pool record their own events through the
//! same global recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::orchestrator::ComputeMetrics;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Call once at startup, before any metrics are recorded. Returns `false`
/// when a recorder is already installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("failed to set global metrics recorder (already set)");
        return false;
    }
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("failed to store Prometheus handle (already set)");
    }

    describe_metrics();
    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_counter!(
        "engine_computations_total",
        "Counter computations, labeled by short-circuit reason"
    );
    describe_counter!(
        "engine_group_errors_total",
        "Aggregation groups that failed and were dropped from the result"
    );
    describe_histogram!(
        "engine_groups_per_computation",
        "Plan groups produced per computation"
    );
    describe_histogram!(
        "engine_aggregate_latency_seconds",
        "Slowest group aggregation per computation"
    );
    describe_histogram!(
        "engine_lookup_latency_seconds",
        "Slowest index lookup per computation"
    );
    describe_counter!(
        "store_pool_events_total",
        "Storage client pool events (created/ready/checkout/checked-in)"
    );
    describe_counter!(
        "pool_worker_events_total",
        "Query worker lifecycle events (spawned/ready/died/respawned)"
    );
    describe_histogram!(
        "pool_batch_exec_seconds",
        "Batch execution time on the worker pool"
    );
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Record one finished counter computation.
pub fn record_compute(m: &ComputeMetrics) {
    let reason = m.reason.clone().unwrap_or_else(|| "computed".to_string());
    counter!("engine_computations_total", "reason" => reason).increment(1);
    if !m.errors.is_empty() {
        counter!("engine_group_errors_total").increment(m.errors.len() as u64);
    }
    if m.reason.is_none() {
        histogram!("engine_groups_per_computation").record(m.group_count as f64);
        histogram!("engine_aggregate_latency_seconds")
            .record(m.aggregate_latency_max_ms as f64 / 1000.0);
        histogram!("engine_lookup_latency_seconds")
            .record(m.lookup_latency_max_ms as f64 / 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_compute_without_recorder() {
        // Recording against no installed recorder must be a no-op.
        record_compute(&ComputeMetrics::default());
    }
}
