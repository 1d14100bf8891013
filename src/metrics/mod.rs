//! Prometheus metrics following standard naming conventions
//!
//! Operational telemetry only; the authoritative per-vhost and per-node
//! request counters live in the dispatch model and are served through the
//! admin `get` endpoint.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    // Dispatch requests by outcome
    pub static ref DISPATCH_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        opts!(
            "zoneroute_dispatch_requests_total",
            "Total number of dispatch requests processed"
        ),
        &["outcome"]  // redirect, zone_probe, unknown_host, invalid_ip, no_backend
    ).unwrap();

    pub static ref DISPATCH_DURATION_SECONDS: Histogram = register_histogram!(
        histogram_opts!(
            "zoneroute_dispatch_duration_seconds",
            "Dispatch decision duration in seconds",
            vec![0.000005, 0.00001, 0.000025, 0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.005]
        )
    ).unwrap();

    // Admin API calls
    pub static ref ADMIN_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        opts!(
            "zoneroute_admin_requests_total",
            "Total number of admin API requests"
        ),
        &["endpoint", "status"]  // endpoint: set, get; status: ok, error
    ).unwrap();
}

/// Record a dispatch outcome.
pub fn observe_dispatch(outcome: &str, seconds: f64) {
    DISPATCH_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
    DISPATCH_DURATION_SECONDS.observe(seconds);
}

/// Record an admin API call.
pub fn observe_admin(endpoint: &str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    ADMIN_REQUESTS_TOTAL.with_label_values(&[endpoint, status]).inc();
}

/// Prometheus text exposition handler.
pub async fn prometheus_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}
