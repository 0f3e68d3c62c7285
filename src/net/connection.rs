//! Inbound connection identity and live-session accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use crate::observability::metrics;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of an inbound connection, shown as `conn-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts sessions between dispatch and teardown.
///
/// The count lives in a `watch` channel so shutdown can await it reaching
/// zero instead of polling.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    live: watch::Sender<u64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self { live }
    }

    /// Count `id` as live until the returned guard drops.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.adjust(|n| n + 1);
        ConnectionGuard {
            live: self.live.clone(),
            id,
        }
    }

    fn adjust(&self, f: impl FnOnce(u64) -> u64) {
        adjust(&self.live, f);
    }

    pub fn active_count(&self) -> u64 {
        *self.live.borrow()
    }

    /// Resolves `true` once no session is live, `false` if `timeout` passes first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut rx = self.live.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn adjust(live: &watch::Sender<u64>, f: impl FnOnce(u64) -> u64) {
    live.send_modify(|n| *n = f(*n));
    metrics::set_active_sessions(*live.borrow());
}

/// Live-session marker returned by [`ConnectionTracker::track`].
#[derive(Debug)]
pub struct ConnectionGuard {
    live: watch::Sender<u64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        adjust(&self.live, |n| n.saturating_sub(1));
        tracing::trace!(connection_id = %self.id, "Session closed");
    }
}
