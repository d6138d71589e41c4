//! Prometheus metrics for the cache engine.
//!
//! Counters are emitted through the `metrics` facade, so they are free when no
//! recorder is installed. Embedding applications either install their own
//! recorder or call [`init_metrics`] and expose [`render_metrics`].

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
    pub const CACHE_L2_ERRORS_TOTAL: &str = "cache_l2_errors_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const CACHE_MEMORY_BYTES: &str = "cache_memory_bytes";
    pub const CACHE_GET_DURATION_SECONDS: &str = "cache_get_duration_seconds";
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

/// Record a cache hit.
pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record entries pushed out of the local tier by LRU pressure.
pub fn record_cache_evictions(count: u64) {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(count);
}

/// Record an absorbed remote tier failure.
pub fn record_l2_error(operation: &'static str) {
    counter!(names::CACHE_L2_ERRORS_TOTAL, "operation" => operation).increment(1);
}

/// Set the number of cache entries and resident bytes of a tier.
pub fn set_cache_usage(tier: &str, entries: usize, bytes: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier.to_string()).set(entries as f64);
    gauge!(names::CACHE_MEMORY_BYTES, "tier" => tier.to_string()).set(bytes as f64);
}

/// Record the end-to-end duration of an orchestrator lookup.
pub fn record_get_duration(duration: Duration) {
    histogram!(names::CACHE_GET_DURATION_SECONDS).record(duration.as_secs_f64());
}
