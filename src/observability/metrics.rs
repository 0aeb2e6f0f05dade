//! Metrics collection and exposition.
//!
//! # Metrics
//! - `polyport_connections_total` (counter): connections handed off, by protocol
//! - `polyport_connections_rejected_total` (counter): connections closed unclassified, by reason
//! - `polyport_active_connections` (gauge): current connection count
//! - `polyport_rpc_calls_total` (counter): client calls by method and outcome
//! - `polyport_rpc_call_duration_seconds` (histogram): client call latency
//! - `polyport_rpc_reconnects_total` (counter): reconnects per remote address
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is opt-in via `observability.metrics_enabled`

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection(protocol: &'static str) {
    ::metrics::counter!("polyport_connections_total", "protocol" => protocol).increment(1);
}

pub fn record_rejection(reason: &'static str) {
    ::metrics::counter!("polyport_connections_rejected_total", "reason" => reason).increment(1);
}

pub fn set_active_connections(active: u64) {
    ::metrics::gauge!("polyport_active_connections").set(active as f64);
}

/// Record a finished client call; `outcome` is `ok` or an error kind.
pub fn record_rpc_call(method: &str, outcome: &'static str, start_time: Instant) {
    ::metrics::counter!(
        "polyport_rpc_calls_total",
        "method" => method.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    ::metrics::histogram!("polyport_rpc_call_duration_seconds").record(start_time.elapsed().as_secs_f64());
}

pub fn record_reconnect(address: SocketAddr) {
    ::metrics::counter!("polyport_rpc_reconnects_total", "address" => address.to_string()).increment(1);
}
