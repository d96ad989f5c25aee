//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_requests_total` (counter): requests by protocol and outcome
//! - `relay_request_duration_seconds` (histogram): time to response head
//! - `relay_fallback_responses_total` (counter): last-resort 500s
//! - `relay_active_connections` (gauge): sockets and tunnels by kind
//! - `relay_http2_sessions_opened_total` (counter): outbound HTTP/2 sessions
//! - `relay_pooled_http2_sessions` (gauge): current pool size
//! - `relay_websocket_tunnels` (gauge): open tunnels

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one dispatched request.
pub fn record_request(protocol: &'static str, status: u16, start: Instant) {
    let outcome = if status >= 500 {
        "error"
    } else {
        "ok"
    };
    metrics::counter!(
        "relay_requests_total",
        "protocol" => protocol,
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "protocol" => protocol)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_fallback() {
    metrics::counter!("relay_fallback_responses_total").increment(1);
}

pub fn connection_opened(kind: &'static str) {
    metrics::gauge!("relay_active_connections", "kind" => kind).increment(1.0);
}

pub fn connection_closed(kind: &'static str) {
    metrics::gauge!("relay_active_connections", "kind" => kind).decrement(1.0);
}

pub fn http2_session_opened() {
    metrics::counter!("relay_http2_sessions_opened_total").increment(1);
}

pub fn pooled_sessions(count: usize) {
    metrics::gauge!("relay_pooled_http2_sessions").set(count as f64);
}

pub fn websocket_tunnel_opened() {
    metrics::gauge!("relay_websocket_tunnels").increment(1.0);
}

pub fn websocket_tunnel_closed() {
    metrics::gauge!("relay_websocket_tunnels").decrement(1.0);
}
