//! Structured gateway events.
//!
//! The core never formats or persists these itself; it hands them to an
//! [`EventSink`]. [`TracingSink`] is the production sink and [`MemorySink`]
//! collects events for inspection.

use std::sync::{Arc, Mutex};

use crate::load_balancer::{BackendId, HealthState};
use crate::observability::metrics;
use crate::session::{EndStatus, SessionKind};

/// Something observable happened inside the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    BackendStateChanged {
        backend: BackendId,
        from: HealthState,
        to: HealthState,
    },
    BackendRegistered {
        backend: BackendId,
        pool: String,
    },
    BackendDeregistered {
        backend: BackendId,
    },
    ConnectionAcquired {
        backend: BackendId,
        connection: u64,
        reused: bool,
    },
    ConnectionReleased {
        backend: BackendId,
        connection: u64,
    },
    ConnectionDiscarded {
        backend: BackendId,
        connection: u64,
        reason: &'static str,
    },
    SessionStarted {
        session: String,
        kind: SessionKind,
        pool: String,
    },
    SessionEnded {
        session: String,
        kind: SessionKind,
        status: EndStatus,
    },
    SessionFailed {
        session: String,
        reason: String,
    },
}

/// Receiver of gateway events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Logs every event and records the matching metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::BackendStateChanged { backend, from, to } => {
                tracing::info!(backend = %backend, from = ?from, to = ?to, "Backend state changed");
                metrics::record_backend_health(backend.as_str(), *to);
            }
            GatewayEvent::BackendRegistered { backend, pool } => {
                tracing::info!(backend = %backend, pool = %pool, "Backend registered");
            }
            GatewayEvent::BackendDeregistered { backend } => {
                tracing::info!(backend = %backend, "Backend deregistered, draining");
            }
            GatewayEvent::ConnectionAcquired { backend, connection, reused } => {
                tracing::trace!(backend = %backend, connection, reused, "Connection acquired");
                metrics::record_connection_event(backend.as_str(), "acquired");
            }
            GatewayEvent::ConnectionReleased { backend, connection } => {
                tracing::trace!(backend = %backend, connection, "Connection released");
                metrics::record_connection_event(backend.as_str(), "released");
            }
            GatewayEvent::ConnectionDiscarded { backend, connection, reason } => {
                tracing::debug!(backend = %backend, connection, reason, "Connection discarded");
                metrics::record_connection_event(backend.as_str(), "discarded");
            }
            GatewayEvent::SessionStarted { session, kind, pool } => {
                tracing::debug!(session = %session, kind = ?kind, pool = %pool, "Session started");
                metrics::record_session_started(*kind);
            }
            GatewayEvent::SessionEnded { session, kind, status } => {
                tracing::debug!(session = %session, kind = ?kind, status = ?status, "Session ended");
                metrics::record_session_ended(*kind, *status);
            }
            GatewayEvent::SessionFailed { session, reason } => {
                tracing::warn!(session = %session, reason = %reason, "Session failed");
            }
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far.
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().expect("event sink mutex poisoned").clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: GatewayEvent) {
        self.events.lock().expect("event sink mutex poisoned").push(event);
    }
}
