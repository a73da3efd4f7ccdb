//! Metrics definitions for the SFU service.
//!
//! Naming follows Prometheus conventions: `sfu_` prefix, `_total` suffix for
//! counters, `_seconds` suffix for duration histograms.
//!
//! # Cardinality
//!
//! - `type`: bounded by the request type set (7 values plus `UNKNOWN`)
//! - `status`: `success` or a wire error code (15 values)
//! - `resource`: router, transport, producer, consumer

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips are in-process engine calls; expect low ms.
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Metric: `sfu_connections_active`
///
/// Incremented when a WebSocket upgrade completes, decremented after the
/// connection's cleanup has run.
pub fn connection_opened() {
    gauge!("sfu_connections_active").increment(1.0);
}

pub fn connection_closed() {
    gauge!("sfu_connections_active").decrement(1.0);
}

/// Record one handled signaling request.
///
/// Metrics: `sfu_signaling_requests_total{type,status}` and
/// `sfu_signaling_request_duration_seconds{type}`.
pub fn record_signaling_request(request_type: &'static str, status: &'static str, duration: Duration) {
    counter!(
        "sfu_signaling_requests_total",
        "type" => request_type,
        "status" => status
    )
    .increment(1);
    histogram!(
        "sfu_signaling_request_duration_seconds",
        "type" => request_type
    )
    .record(duration.as_secs_f64());
}

/// Metric: `sfu_push_dropped_total`
///
/// Non-zero means some client is not draining its socket.
pub fn record_push_dropped() {
    counter!("sfu_push_dropped_total").increment(1);
}

/// Metric: `sfu_close_failures_total{resource}`
pub fn record_close_failure(resource: &'static str) {
    counter!("sfu_close_failures_total", "resource" => resource).increment(1);
}
