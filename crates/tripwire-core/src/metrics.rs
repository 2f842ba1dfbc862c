//! Prometheus metrics helpers for Tripwire.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across the sensor and the ingest pump.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tripwire_core::metrics::{try_init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     if let Some(handle) = try_init_metrics() {
//!         start_metrics_server(9091, handle).await.unwrap();
//!     }
//!
//!     metrics::counter!("indexer_records_indexed_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`sensor_`, `tailer_`, `indexer_`, `ingest_`)
//! - Suffix: unit or type (`_total`, `_bytes`)
//! - Labels: only `category` on detection counters (closed set)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed (e.g. when both the
/// sensor and the pump run in one test process).
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves `/metrics` on the given port from a background task. Binding
/// happens before returning so a taken port is reported to the caller.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics used across Tripwire.
fn register_common_metrics() {
    // =========================================================================
    // Sensor
    // =========================================================================

    describe_counter!(
        "sensor_events_detected_total",
        "Requests classified as attacks (label: category)"
    );
    describe_counter!(
        "sensor_write_errors_total",
        "Attack events lost because the log append failed"
    );

    // =========================================================================
    // Tailer
    // =========================================================================

    describe_counter!(
        "tailer_lines_read_total",
        "Complete lines read from the event log"
    );
    describe_counter!(
        "tailer_gaps_total",
        "Times the cursor was reset because the log shrank or was replaced"
    );

    // =========================================================================
    // Indexer
    // =========================================================================

    describe_counter!(
        "indexer_records_indexed_total",
        "Records accepted by the index engine"
    );
    describe_counter!(
        "indexer_records_failed_total",
        "Records skipped because the engine rejected them or timed out"
    );
    describe_counter!(
        "indexer_records_malformed_total",
        "Log lines skipped because they were not valid attack events"
    );
    describe_counter!(
        "indexer_cycles_skipped_total",
        "Pump cycles skipped because the engine was unreachable or a cycle was running"
    );
    describe_gauge!("indexer_cursor_offset", "Committed byte offset into the event log");
    describe_gauge!(
        "ingest_running",
        "Whether the ingest pump is running (1=yes, 0=no)"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        let _ = try_init_metrics();
        increment("test_counter", 0);
        increment("test_counter", 5);
        set_gauge("test_gauge", 42.5);
        register_common_metrics();
    }
}
