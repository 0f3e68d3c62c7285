//! Pooled outbound connections.
//!
//! A [`PooledConnection`] is IN_USE for exactly as long as one owner holds
//! the value; handing it back through
//! [`ConnectionPoolManager::release`](crate::pool::ConnectionPoolManager::release)
//! returns it to IDLE or closes it. Dropping it without releasing closes the
//! stream and still settles the backend's active count.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;

use crate::load_balancer::{Backend, BackendId, BackendRegistry};
use crate::net::BoxedStream;
use crate::observability::{GatewayEvent, SharedSink};

/// Holds one unit of a backend's active-connection count.
pub(crate) struct BackendLease {
    registry: Arc<BackendRegistry>,
    backend: Arc<Backend>,
}

impl BackendLease {
    pub(crate) fn open(registry: Arc<BackendRegistry>, backend: Arc<Backend>) -> Self {
        registry.connection_opened(&backend);
        Self { registry, backend }
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.registry.connection_closed(&self.backend);
    }
}

/// A connection parked in a backend's idle list.
pub(crate) struct IdleConnection {
    pub(crate) id: u64,
    pub(crate) stream: BoxedStream,
    pub(crate) idle_since: Instant,
}

/// An outbound link owned by one session.
pub struct PooledConnection {
    id: u64,
    backend: Arc<Backend>,
    pub(crate) stream: Option<BoxedStream>,
    pub(crate) lease: Option<BackendLease>,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
    reused: bool,
    events: SharedSink,
}

impl PooledConnection {
    pub(crate) fn new(
        id: u64,
        backend: Arc<Backend>,
        stream: BoxedStream,
        lease: BackendLease,
        permit: OwnedSemaphorePermit,
        reused: bool,
        events: SharedSink,
    ) -> Self {
        Self {
            id,
            backend,
            stream: Some(stream),
            lease: Some(lease),
            permit: Some(permit),
            reused,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend_id(&self) -> &BackendId {
        self.backend.id()
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Whether this connection came from the idle list.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// The underlying stream. Only `None` after [`take_stream`](Self::take_stream).
    pub fn stream_mut(&mut self) -> Option<&mut BoxedStream> {
        self.stream.as_mut()
    }

    /// Move the stream out (e.g. to split it). The connection can then only
    /// be released as not reusable.
    pub fn take_stream(&mut self) -> Option<BoxedStream> {
        self.stream.take()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.lease.is_some() {
            self.events.emit(GatewayEvent::ConnectionDiscarded {
                backend: self.backend.id().clone(),
                connection: self.id,
                reason: "dropped",
            });
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("backend", self.backend.id())
            .field("reused", &self.reused)
            .finish()
    }
}
