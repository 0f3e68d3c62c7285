//! Session multiplexer.
//!
//! # Data Flow
//! ```text
//! Classified connection
//!     UNARY  → unary.rs: request frame → backend → Response frame
//!                 (idempotency.rs gates keyed requests)
//!     STREAM → stream.rs: opening frame → backend → Data{seq} frames
//!                 (link.rs owns the backend side; directory.rs + replay.rs
//!                  serve resumption)
//!
//! Outbound links come from connect_upstream (select + acquire, one reselect).
//! ```
//!
//! # Design Decisions
//! - Each session owns its pooled connection; release happens exactly once
//! - Sequence numbers are assigned by the gateway, not the backend
//! - Reads run in their own tasks so cancellation never lands mid-frame

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::{IdempotencyConfig, SessionConfig};
use crate::error::{GatewayError, Result};
use crate::load_balancer::{BackendId, LoadBalancer, RoutingHint};
use crate::net::{FrameCodec, ProtocolKind};
use crate::observability::SharedSink;
use crate::pool::{AcquirePolicy, ConnectionPoolManager, PooledConnection};
use crate::resilience::backoff::calculate_backoff;

pub mod directory;
pub mod frame;
pub mod idempotency;
pub mod link;
pub mod replay;
pub mod stream;
pub mod unary;

pub use directory::{Attachment, SessionDirectory, SessionState};
pub use frame::{ClientFrame, FrameError};
pub use idempotency::{IdempotencyStore, Resolution};
pub use link::ParkedLink;
pub use replay::{Replay, ReplayBuffer};
pub use unary::UnaryReply;

/// Short-lived request/response or long-lived stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Unary,
    Stream,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Unary => "unary",
            SessionKind::Stream => "stream",
        }
    }
}

impl From<ProtocolKind> for SessionKind {
    fn from(kind: ProtocolKind) -> Self {
        if kind == ProtocolKind::Unary {
            SessionKind::Unary
        } else {
            SessionKind::Stream
        }
    }
}

/// How a session ended, as told to the inbound side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndStatus {
    Clean,
    Failed,
}

impl EndStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EndStatus::Clean => "clean",
            EndStatus::Failed => "failed",
        }
    }
}

/// Set once when the inbound side goes away.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Everything a session needs from the rest of the gateway.
pub struct SessionContext {
    pub balancer: Arc<LoadBalancer>,
    pub pools: Arc<ConnectionPoolManager>,
    pub directory: SessionDirectory,
    pub idempotency: IdempotencyStore<UnaryReply>,
    pub config: SessionConfig,
    pub idempotency_config: IdempotencyConfig,
    pub codec: FrameCodec,
    pub events: SharedSink,
}

impl SessionContext {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        pools: Arc<ConnectionPoolManager>,
        config: SessionConfig,
        idempotency_config: IdempotencyConfig,
        events: SharedSink,
    ) -> Self {
        Self {
            directory: SessionDirectory::new(config.replay_buffer_size, config.retention()),
            idempotency: IdempotencyStore::new(idempotency_config.ttl()),
            codec: FrameCodec::new(config.max_frame_bytes),
            balancer,
            pools,
            config,
            idempotency_config,
            events,
        }
    }

    /// Select a backend and acquire a connection to it. A failed backend or
    /// an exhausted pool gets exactly one reselect, avoiding the failed backend.
    pub async fn connect_upstream(
        &self,
        pool: &str,
        hint: &RoutingHint,
        policy: AcquirePolicy,
    ) -> Result<PooledConnection> {
        match self.try_upstream(pool, hint, policy, None).await {
            Ok(conn) => Ok(conn),
            Err((err, Some(failed))) if err.is_retriable() => {
                if matches!(err, GatewayError::NoCapacity { .. }) {
                    tokio::time::sleep(calculate_backoff(1, 10, 100)).await;
                }
                tracing::debug!(pool, failed = %failed, error = %err, "Reselecting backend");
                self.try_upstream(pool, hint, policy, Some(&failed))
                    .await
                    .map_err(|(err, _)| err)
            }
            Err((err, _)) => Err(err),
        }
    }

    /// One select + acquire. On failure, also returns the backend that failed.
    pub async fn try_upstream(
        &self,
        pool: &str,
        hint: &RoutingHint,
        policy: AcquirePolicy,
        exclude: Option<&BackendId>,
    ) -> std::result::Result<PooledConnection, (GatewayError, Option<BackendId>)> {
        let selected = match exclude {
            Some(failed) => self.balancer.select_excluding(pool, hint, failed),
            None => self.balancer.select(pool, hint),
        }
        .map_err(|e| (e, None))?;

        self.pools
            .acquire(&selected.id, policy)
            .await
            .map_err(|e| (e, Some(selected.id.clone())))
    }

    /// Drop expired idempotency records and detached stream sessions.
    pub fn sweep(&self) -> (usize, usize) {
        (self.idempotency.sweep(), self.directory.sweep())
    }
}
