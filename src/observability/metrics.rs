//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_sessions_total` (counter): sessions started by kind
//! - `gateway_sessions_ended_total` (counter): sessions ended by kind, status
//! - `gateway_active_sessions` (gauge): live inbound connections
//! - `gateway_backend_health` (gauge): 2=healthy, 1=degraded, 0=unhealthy, -1=unknown
//! - `gateway_pool_connections_total` (counter): acquired/released/discarded by backend
//! - `gateway_frames_forwarded_total` (counter): stream frames relayed
//! - `gateway_unary_duration_seconds` (histogram): unary round-trip latency
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::load_balancer::HealthState;
use crate::session::{EndStatus, SessionKind};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_backend_health(backend: &str, state: HealthState) {
    let value = match state {
        HealthState::Healthy => 2.0,
        HealthState::Degraded => 1.0,
        HealthState::Unhealthy => 0.0,
        HealthState::Unknown => -1.0,
    };
    gauge!("gateway_backend_health", "backend" => backend.to_string()).set(value);
}

pub fn record_connection_event(backend: &str, event: &'static str) {
    counter!(
        "gateway_pool_connections_total",
        "backend" => backend.to_string(),
        "event" => event
    )
    .increment(1);
}

pub fn record_session_started(kind: SessionKind) {
    counter!("gateway_sessions_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_session_ended(kind: SessionKind, status: EndStatus) {
    counter!(
        "gateway_sessions_ended_total",
        "kind" => kind.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

pub fn set_active_sessions(count: u64) {
    gauge!("gateway_active_sessions").set(count as f64);
}

pub fn record_frame_forwarded(pool: &str) {
    counter!("gateway_frames_forwarded_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_unary(pool: &str, outcome: &'static str, start: Instant) {
    histogram!(
        "gateway_unary_duration_seconds",
        "pool" => pool.to_string(),
        "outcome" => outcome
    )
    .record(start.elapsed().as_secs_f64());
}
