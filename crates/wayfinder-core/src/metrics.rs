//! Prometheus metrics helpers for the Wayfinder subsystem.
//!
//! Provides centralized metrics initialization and the descriptions for the
//! metrics emitted by the pool, router, and scheduler.
//!
//! # Usage
//!
//! ```rust,ignore
//! use wayfinder_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     use metrics::counter;
//!     counter!("discovery_runs_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`pool_`, `discovery_`, `routes_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly to avoid cardinality explosion (never relay URLs)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already
/// installed, instead of panicking. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. Spawns a background
/// task and returns immediately.
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
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

/// Register descriptions for the metrics emitted across Wayfinder.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Connection Pool Metrics
    // =========================================================================

    describe_gauge!("pool_sessions_open", "Relay sessions currently open");
    describe_counter!("pool_connects_total", "Successful relay socket connects");
    describe_counter!(
        "pool_connect_failures_total",
        "Failed relay socket connect attempts"
    );
    describe_counter!(
        "pool_reconnects_total",
        "Reconnect attempts after an unexpected close"
    );
    describe_counter!(
        "pool_sessions_degraded_total",
        "Sessions marked degraded after exhausting their retry budget"
    );
    describe_counter!(
        "pool_sessions_evicted_total",
        "Idle sessions evicted by the pool (label: reason)"
    );
    describe_counter!(
        "pool_capacity_rejections_total",
        "getConnection calls rejected at the connection ceiling"
    );

    // =========================================================================
    // Query / Publish Metrics
    // =========================================================================

    describe_counter!("query_events_total", "Events collected by query_sync");
    describe_counter!(
        "query_relay_failures_total",
        "Per-relay query failures swallowed into empty results"
    );
    describe_histogram!(
        "query_duration_seconds",
        "Wall time of query_sync calls"
    );
    describe_counter!("publish_ok_total", "Per-relay publish acceptances");
    describe_counter!("publish_failures_total", "Per-relay publish failures");

    // =========================================================================
    // Outbox Discovery Metrics
    // =========================================================================

    describe_counter!("discovery_runs_total", "Discovery runs started");
    describe_counter!(
        "discovery_batches_total",
        "Discovery batches issued against bootstrap relays"
    );
    describe_counter!(
        "discovery_documents_total",
        "Relay-preference documents returned by bootstrap relays"
    );
    describe_counter!(
        "discovery_documents_invalid_total",
        "Preference documents rejected by validation"
    );
    describe_counter!(
        "discovery_users_discovered_total",
        "Users whose routes were upserted by discovery"
    );
    describe_gauge!(
        "discovery_in_progress",
        "Whether a discovery run is active (1=yes, 0=no)"
    );
    describe_gauge!("discovery_last_run_unix", "Unix time of the last completed run");
    describe_histogram!(
        "discovery_run_duration_seconds",
        "Wall time of complete discovery runs"
    );

    // =========================================================================
    // Routing Storage Metrics
    // =========================================================================

    describe_counter!("routes_upserted_total", "Routes written by upsert");
    describe_counter!(
        "routes_dropped_total",
        "Parsed routes dropped for having neither read nor write"
    );
    describe_gauge!("routes_users", "Users present in the routing table");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();
        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
