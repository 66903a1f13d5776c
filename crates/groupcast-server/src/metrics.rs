//! Prometheus metrics for the coordination layer.
//!
//! This module provides:
//! - Cache metrics (hit/miss rates, backend faults)
//! - Duplicate request rejections
//! - Websocket group metrics (active groups, connections, heartbeat evictions)

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_BACKEND_ERRORS_TOTAL: &str = "cache_backend_errors_total";

    // Duplicate guard metrics
    pub const DUPLICATE_REQUESTS_REJECTED_TOTAL: &str = "duplicate_requests_rejected_total";

    // Group metrics
    pub const GROUPS_ACTIVE: &str = "groups_active";
    pub const GROUP_CONNECTIONS_TOTAL: &str = "group_connections_total";
    pub const GROUP_HEARTBEAT_EVICTIONS_TOTAL: &str = "group_heartbeat_evictions_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at server startup.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics is served by the router
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
// Cache Metrics
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record a swallowed backend fault on a cache path.
pub fn record_cache_backend_error(operation: &'static str) {
    counter!(names::CACHE_BACKEND_ERRORS_TOTAL, "operation" => operation).increment(1);
}

// =============================================================================
// Duplicate Guard Metrics
// =============================================================================

pub fn record_duplicate_rejected() {
    counter!(names::DUPLICATE_REQUESTS_REJECTED_TOTAL).increment(1);
}

// =============================================================================
// Group Metrics
// =============================================================================

/// Set the number of groups hosted by this process.
pub fn set_active_groups(count: usize) {
    gauge!(names::GROUPS_ACTIVE).set(count as f64);
}

pub fn record_connection_added() {
    counter!(names::GROUP_CONNECTIONS_TOTAL).increment(1);
}

pub fn record_heartbeat_eviction() {
    counter!(names::GROUP_HEARTBEAT_EVICTIONS_TOTAL).increment(1);
}
