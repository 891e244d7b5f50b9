//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (requests, latency, connections, tunnels)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `server_requests_total` (counter): requests by method, status
//! - `server_request_duration_seconds` (histogram): dispatch latency
//! - `server_active_connections` (gauge): current connection count
//! - `server_active_tunnels` (gauge): CONNECT tunnels being relayed
//! - `server_tunnel_bytes_total` (counter): relayed bytes by direction
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op, so embedders that
//!   don't want metrics pay nothing
//! - Labels stay low-cardinality: no paths, no peer addresses

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Count a finished request and record its duration.
pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!("server_requests_total", "method" => method.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!("server_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// Track a newly accepted connection.
pub fn connection_opened() {
    gauge!("server_active_connections").increment(1.0);
}

/// Track a closed or handed-off connection.
pub fn connection_closed() {
    gauge!("server_active_connections").decrement(1.0);
}

/// Track a tunnel that started relaying.
pub fn tunnel_opened() {
    gauge!("server_active_tunnels").increment(1.0);
}

/// Record a finished tunnel and the bytes it moved each way.
pub fn tunnel_closed(client_to_target: u64, target_to_client: u64) {
    gauge!("server_active_tunnels").decrement(1.0);
    counter!("server_tunnel_bytes_total", "direction" => "upstream").increment(client_to_target);
    counter!("server_tunnel_bytes_total", "direction" => "downstream").increment(target_to_client);
}
