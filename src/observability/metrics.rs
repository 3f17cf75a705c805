//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bootstrap_connections_total` (counter): accepted connections
//! - `bootstrap_active_connections` (gauge): currently open connections
//! - `bootstrap_request_timeouts_total` (counter): requests cut off by the write timeout
//! - `bootstrap_shutdowns_total` (counter): shutdowns by outcome (`drained`, `timed_out`)
//! - `bootstrap_shutdown_duration_seconds` (histogram): time spent draining
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed
//! - The Prometheus endpoint is opt-in

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened(active: u64) {
    ::metrics::counter!("bootstrap_connections_total").increment(1);
    ::metrics::gauge!("bootstrap_active_connections").set(active as f64);
}

pub fn record_connection_closed(active: u64) {
    ::metrics::gauge!("bootstrap_active_connections").set(active as f64);
}

pub fn record_request_timeout() {
    ::metrics::counter!("bootstrap_request_timeouts_total").increment(1);
}

/// Record how a drain ended and how long it took.
pub fn record_shutdown(outcome: &'static str, elapsed: Duration) {
    ::metrics::counter!("bootstrap_shutdowns_total", "outcome" => outcome).increment(1);
    ::metrics::histogram!("bootstrap_shutdown_duration_seconds").record(elapsed.as_secs_f64());
}
