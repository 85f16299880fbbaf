//! Prometheus metrics for the cache facade.
//!
//! This module provides:
//! - Per-operation counters and latency histograms
//! - Hit/miss rates per tier
//! - Circuit breaker transitions and rejections
//! - Warming, invalidation and cluster topology counters

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Operation metrics
    pub const CACHE_OPERATIONS_TOTAL: &str = "cache_operations_total";
    pub const CACHE_OPERATION_DURATION_SECONDS: &str = "cache_operation_duration_seconds";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";

    // Hit/miss metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";

    // Circuit breaker metrics
    pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "cache_circuit_transitions_total";
    pub const CIRCUIT_REJECTIONS_TOTAL: &str = "cache_circuit_rejections_total";

    // Background task metrics
    pub const WARMING_TOTAL: &str = "cache_warming_total";
    pub const WARMING_CYCLE_DURATION_SECONDS: &str = "cache_warming_cycle_duration_seconds";
    pub const INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
    pub const INVALIDATED_KEYS_TOTAL: &str = "cache_invalidated_keys_total";
    pub const TOPOLOGY_EVENTS_TOTAL: &str = "cache_topology_events_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Operation Metrics
// =============================================================================

/// Count a backend operation outcome.
pub fn record_operation(operation: &'static str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        names::CACHE_OPERATIONS_TOTAL,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Record the end-to-end latency of a facade operation.
pub fn record_operation_duration(operation: &'static str, duration: Duration) {
    histogram!(names::CACHE_OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Count a failed operation by error type.
pub fn record_error(operation: &'static str, error_type: &'static str) {
    counter!(
        names::CACHE_ERRORS_TOTAL,
        "operation" => operation,
        "error_type" => error_type
    )
    .increment(1);
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Set the number of cache entries.
pub fn set_cache_entries(tier: &'static str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier).set(count as f64);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

pub fn record_circuit_transition(state: &'static str) {
    counter!(names::CIRCUIT_TRANSITIONS_TOTAL, "state" => state).increment(1);
}

pub fn record_circuit_rejection() {
    counter!(names::CIRCUIT_REJECTIONS_TOTAL).increment(1);
}

// =============================================================================
// Background Task Metrics
// =============================================================================

pub fn record_warming(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(names::WARMING_TOTAL, "status" => status).increment(1);
}

pub fn record_warming_cycle(duration: Duration) {
    histogram!(names::WARMING_CYCLE_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_invalidation(event_type: &str, keys: u64) {
    counter!(names::INVALIDATIONS_TOTAL, "event_type" => event_type.to_string()).increment(1);
    counter!(names::INVALIDATED_KEYS_TOTAL).increment(keys);
}

pub fn record_topology_event(event: &'static str) {
    counter!(names::TOPOLOGY_EVENTS_TOTAL, "event" => event).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_output_contains_recorded_metrics() {
        init_metrics();
        assert!(!init_metrics(), "second init is a no-op");

        record_operation("get", true);
        record_error("get", "timeout");
        record_cache_hit("local");
        record_invalidation("OrderShipped", 4);

        let text = render_metrics().expect("metrics initialized");
        assert!(text.contains(names::CACHE_OPERATIONS_TOTAL));
        assert!(text.contains(names::CACHE_ERRORS_TOTAL));
        assert!(text.contains(names::INVALIDATED_KEYS_TOTAL));
    }
}
