//! Connection pool manager.
//!
//! # Responsibilities
//! - Bound IN_USE connections per backend (semaphore permits)
//! - Reuse IDLE connections, closing ones past the idle timeout
//! - Never return a connection to IDLE after a forwarding error
//! - Account traffic failures and active counts in the registry
//! - Run health probes on dedicated connections

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::time;

use crate::config::{ConnectionPoolConfig, ProbeKind};
use crate::error::{GatewayError, Result};
use crate::health::state::{Outcome, ReportSource};
use crate::load_balancer::{Backend, BackendId, BackendRegistry, ProtocolClass};
use crate::net::{BackendConnector, BoxedStream};
use crate::observability::{GatewayEvent, SharedSink};
use crate::pool::connection::{BackendLease, IdleConnection, PooledConnection};
use crate::pool::probe;

/// How long `acquire` may wait for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Fail immediately with `NoCapacity` (unary traffic).
    FailFast,
    /// Wait up to the given duration (stream sessions).
    Wait(Duration),
}

/// What happened to a connection while it was in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Exchange completed at a frame boundary; may be reused.
    Reusable,
    /// Finished cleanly but the stream state is not reusable.
    NotReusable,
    /// A forwarding error occurred; discard and count a failure.
    Failed,
}

struct BackendPool {
    backend: Arc<Backend>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
}

impl BackendPool {
    fn new(backend: Arc<Backend>, max_size: usize) -> Self {
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(VecDeque::new()),
        }
    }

    fn take_idle(&self) -> Vec<IdleConnection> {
        self.idle
            .lock()
            .expect("idle list mutex poisoned")
            .drain(..)
            .collect()
    }
}

/// Owns every outbound connection.
pub struct ConnectionPoolManager {
    registry: Arc<BackendRegistry>,
    connector: Arc<dyn BackendConnector>,
    pools: DashMap<BackendId, Arc<BackendPool>>,
    config: ConnectionPoolConfig,
    events: SharedSink,
    next_id: AtomicU64,
}

impl ConnectionPoolManager {
    pub fn new(
        registry: Arc<BackendRegistry>,
        connector: Arc<dyn BackendConnector>,
        config: ConnectionPoolConfig,
        events: SharedSink,
    ) -> Self {
        Self {
            registry,
            connector,
            pools: DashMap::new(),
            config,
            events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    fn pool_for(&self, backend: &Arc<Backend>) -> Arc<BackendPool> {
        let mut entry = self
            .pools
            .entry(backend.id().clone())
            .or_insert_with(|| Arc::new(BackendPool::new(backend.clone(), self.config.max_size)));

        if !Arc::ptr_eq(&entry.backend, backend) {
            // re-registered under the same id; the old pool drains on release
            let stale = std::mem::replace(
                &mut *entry,
                Arc::new(BackendPool::new(backend.clone(), self.config.max_size)),
            );
            self.close_all(stale.take_idle(), stale.backend.id(), "backend_replaced");
        }
        entry.clone()
    }

    /// Take a connection to `backend` for exclusive use.
    pub async fn acquire(&self, backend_id: &BackendId, policy: AcquirePolicy) -> Result<PooledConnection> {
        let backend = self
            .registry
            .get(backend_id)
            .ok_or_else(|| GatewayError::BackendUnavailable {
                backend: backend_id.clone(),
                reason: "not registered".to_string(),
            })?;
        let pool = self.pool_for(&backend);

        let no_capacity = || GatewayError::NoCapacity {
            backend: backend_id.clone(),
        };
        let permit = match policy {
            AcquirePolicy::FailFast => pool.permits.clone().try_acquire_owned().map_err(|_| no_capacity())?,
            AcquirePolicy::Wait(wait) => time::timeout(wait, pool.permits.clone().acquire_owned())
                .await
                .map_err(|_| no_capacity())?
                .map_err(|_| no_capacity())?,
        };

        if let Some(idle) = self.pop_idle(&pool) {
            let conn = PooledConnection::new(
                idle.id,
                backend.clone(),
                idle.stream,
                BackendLease::open(self.registry.clone(), backend.clone()),
                permit,
                true,
                self.events.clone(),
            );
            self.events.emit(GatewayEvent::ConnectionAcquired {
                backend: backend_id.clone(),
                connection: conn.id(),
                reused: true,
            });
            return Ok(conn);
        }

        let stream = match self.connect(&backend).await {
            Ok(stream) => stream,
            Err(reason) => {
                tracing::warn!(backend = %backend_id, reason = %reason, "Backend connect failed");
                self.registry.report_on(&backend, Outcome::Failure, ReportSource::Traffic);
                return Err(GatewayError::BackendUnavailable {
                    backend: backend_id.clone(),
                    reason,
                });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = PooledConnection::new(
            id,
            backend.clone(),
            stream,
            BackendLease::open(self.registry.clone(), backend.clone()),
            permit,
            false,
            self.events.clone(),
        );
        self.events.emit(GatewayEvent::ConnectionAcquired {
            backend: backend_id.clone(),
            connection: id,
            reused: false,
        });
        Ok(conn)
    }

    fn pop_idle(&self, pool: &BackendPool) -> Option<IdleConnection> {
        let idle_timeout = self.config.idle_timeout();
        let mut expired = Vec::new();
        let found = {
            let mut idle = pool.idle.lock().expect("idle list mutex poisoned");
            let mut found = None;
            // newest first keeps warm connections warm
            while let Some(conn) = idle.pop_back() {
                if conn.idle_since.elapsed() >= idle_timeout {
                    expired.push(conn);
                } else {
                    found = Some(conn);
                    break;
                }
            }
            found
        };
        self.close_all(expired, pool.backend.id(), "idle_timeout");
        found
    }

    async fn connect(&self, backend: &Backend) -> std::result::Result<BoxedStream, String> {
        match time::timeout(self.config.connect_timeout(), self.connector.connect(backend.target())).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("connect timed out".to_string()),
        }
    }

    /// Hand a connection back.
    pub fn release(&self, mut conn: PooledConnection, outcome: ReleaseOutcome) {
        let backend = conn.backend().clone();
        let id = conn.id();
        let stream = conn.stream.take();
        let lease = conn.lease.take();
        let permit = conn.permit.take();

        let reason = match (outcome, stream) {
            (ReleaseOutcome::Failed, _) => {
                self.registry.report_on(&backend, Outcome::Failure, ReportSource::Traffic);
                Some("forwarding_error")
            }
            (ReleaseOutcome::NotReusable, _) | (ReleaseOutcome::Reusable, None) => Some("not_reusable"),
            (ReleaseOutcome::Reusable, Some(stream)) => {
                self.registry.report_on(&backend, Outcome::Success, ReportSource::Traffic);
                self.park(&backend, id, stream)
            }
        };

        match reason {
            Some(reason) => self.events.emit(GatewayEvent::ConnectionDiscarded {
                backend: backend.id().clone(),
                connection: id,
                reason,
            }),
            None => self.events.emit(GatewayEvent::ConnectionReleased {
                backend: backend.id().clone(),
                connection: id,
            }),
        }

        drop(lease);
        drop(permit);
    }

    /// Park a reusable stream. Returns a discard reason if it was closed instead.
    fn park(&self, backend: &Arc<Backend>, id: u64, stream: BoxedStream) -> Option<&'static str> {
        if backend.is_draining() {
            return Some("draining");
        }
        let pool = match self.pools.get(backend.id()) {
            Some(pool) if Arc::ptr_eq(&pool.backend, backend) => pool.clone(),
            _ => return Some("backend_replaced"),
        };

        let mut idle = pool.idle.lock().expect("idle list mutex poisoned");
        if idle.len() >= self.config.max_idle {
            return Some("idle_limit");
        }
        idle.push_back(IdleConnection {
            id,
            stream,
            idle_since: Instant::now(),
        });
        None
    }

    /// Close idle connections past the timeout and forget drained backends.
    /// Returns the number of connections closed.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let mut closed = 0;
        let mut gone = Vec::new();

        for entry in self.pools.iter() {
            let pool = entry.value();
            if pool.backend.is_draining() {
                let idle = pool.take_idle();
                closed += idle.len();
                self.close_all(idle, pool.backend.id(), "draining");
                if pool.backend.active_connections() == 0 {
                    gone.push(entry.key().clone());
                }
                continue;
            }

            let expired: Vec<IdleConnection> = {
                let mut idle = pool.idle.lock().expect("idle list mutex poisoned");
                let (keep, expired): (VecDeque<_>, VecDeque<_>) = idle
                    .drain(..)
                    .partition(|c| c.idle_since.elapsed() < idle_timeout);
                *idle = keep;
                Vec::from(expired)
            };
            closed += expired.len();
            self.close_all(expired, pool.backend.id(), "idle_timeout");
        }

        for id in gone {
            self.pools.remove_if(&id, |_, pool| pool.backend.is_draining());
        }
        closed
    }

    /// Close the idle connections of a deregistered backend now.
    pub fn drain(&self, backend_id: &BackendId) {
        if let Some(pool) = self.pools.get(backend_id).map(|p| p.clone()) {
            if pool.backend.is_draining() {
                self.close_all(pool.take_idle(), backend_id, "draining");
            }
        }
    }

    /// Number of IDLE connections held for `backend_id`.
    pub fn idle_count(&self, backend_id: &BackendId) -> usize {
        self.pools
            .get(backend_id)
            .map(|p| p.idle.lock().expect("idle list mutex poisoned").len())
            .unwrap_or(0)
    }

    fn close_all(&self, conns: Vec<IdleConnection>, backend: &BackendId, reason: &'static str) {
        for conn in conns {
            self.events.emit(GatewayEvent::ConnectionDiscarded {
                backend: backend.clone(),
                connection: conn.id,
                reason,
            });
        }
    }

    /// Probe a backend on a dedicated connection, outside acquire/release.
    pub async fn probe(&self, backend: &Backend, kind: ProbeKind, path: &str, deadline: Duration) -> Result<()> {
        let target = backend.target();
        let attempt = async {
            let stream = self.connector.connect(target).await.map_err(|e| e.to_string())?;
            match (kind, target.protocol) {
                (ProbeKind::Http, ProtocolClass::Http) => probe::http_get(stream, target, path).await,
                _ => Ok(()),
            }
        };

        match time::timeout(deadline, attempt).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(GatewayError::BackendUnavailable {
                backend: backend.id().clone(),
                reason,
            }),
            Err(_) => Err(GatewayError::Timeout { operation: "health probe" }),
        }
    }

    /// Periodically evict idle connections until shutdown.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.config.reap_interval_secs.max(1));
        let mut ticker = time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let closed = self.evict_idle();
                    if closed > 0 {
                        tracing::debug!(closed, "Idle connections evicted");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Pool reaper stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthThresholds;
    use crate::load_balancer::{BackendTarget, HealthState};
    use crate::observability::MemorySink;
    use crate::testing::MemoryConnector;
    use std::collections::HashSet;

    fn setup(config: ConnectionPoolConfig) -> (Arc<BackendRegistry>, Arc<ConnectionPoolManager>, Arc<MemoryConnector>, BackendId) {
        let sink = Arc::new(MemorySink::new());
        let registry = Arc::new(BackendRegistry::new(HealthThresholds::new(1, 3), sink.clone()).assume_healthy());
        let id = BackendId::from("a");
        registry
            .register(Backend::new(id.clone(), "api", BackendTarget::parse("10.0.0.1:80").unwrap(), 1))
            .unwrap();
        let connector = Arc::new(MemoryConnector::echo());
        let pools = Arc::new(ConnectionPoolManager::new(registry.clone(), connector.clone(), config, sink));
        (registry, pools, connector, id)
    }

    fn config(max_size: usize, max_idle: usize) -> ConnectionPoolConfig {
        ConnectionPoolConfig {
            max_size,
            max_idle,
            ..ConnectionPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn reuses_released_connection() {
        let (registry, pools, connector, id) = setup(config(4, 4));
        let conn = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        let first = conn.id();
        assert_eq!(registry.snapshot(&id).unwrap().active_connections, 1);

        pools.release(conn, ReleaseOutcome::Reusable);
        assert_eq!(registry.snapshot(&id).unwrap().active_connections, 0);
        assert_eq!(pools.idle_count(&id), 1);

        let again = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        assert_eq!(again.id(), first);
        assert!(again.is_reused());
        assert_eq!(connector.connects(), 1);
        pools.release(again, ReleaseOutcome::Reusable);
    }

    #[tokio::test]
    async fn failed_connections_are_never_reused() {
        let (registry, pools, connector, id) = setup(config(4, 4));
        let conn = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        pools.release(conn, ReleaseOutcome::Failed);
        assert_eq!(pools.idle_count(&id), 0);
        assert_eq!(registry.snapshot(&id).unwrap().consecutive_failures, 1);

        let next = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        assert!(!next.is_reused());
        assert_eq!(connector.connects(), 2);
        pools.release(next, ReleaseOutcome::NotReusable);
        assert_eq!(pools.idle_count(&id), 0);
    }

    #[tokio::test]
    async fn exhausted_pool_fails_fast_or_waits() {
        let (_, pools, _, id) = setup(config(1, 1));
        let held = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();

        assert!(matches!(
            pools.acquire(&id, AcquirePolicy::FailFast).await,
            Err(GatewayError::NoCapacity { .. })
        ));
        assert!(matches!(
            pools.acquire(&id, AcquirePolicy::Wait(Duration::from_millis(20))).await,
            Err(GatewayError::NoCapacity { .. })
        ));

        let waiter = {
            let pools = pools.clone();
            let id = id.clone();
            tokio::spawn(async move { pools.acquire(&id, AcquirePolicy::Wait(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pools.release(held, ReleaseOutcome::Reusable);
        let conn = waiter.await.unwrap().unwrap();
        pools.release(conn, ReleaseOutcome::Reusable);
    }

    #[tokio::test]
    async fn connection_never_held_by_two_sessions() {
        let (registry, pools, _, id) = setup(config(4, 2));
        let in_use = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pools = pools.clone();
            let id = id.clone();
            let in_use = in_use.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let conn = pools
                        .acquire(&id, AcquirePolicy::Wait(Duration::from_secs(5)))
                        .await
                        .unwrap();
                    assert!(in_use.lock().unwrap().insert(conn.id()), "connection handed out twice");
                    tokio::task::yield_now().await;
                    assert!(in_use.lock().unwrap().remove(&conn.id()));
                    pools.release(conn, ReleaseOutcome::Reusable);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.snapshot(&id).unwrap().active_connections, 0);
        assert!(pools.idle_count(&id) <= 2);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (registry, pools, connector, id) = setup(config(4, 4));
        connector.fail_target("10.0.0.1:80");
        let err = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
        assert_eq!(registry.snapshot(&id).unwrap().consecutive_failures, 1);
        assert_eq!(registry.snapshot(&id).unwrap().active_connections, 0);
    }

    #[tokio::test]
    async fn idle_connections_expire() {
        let (_, pools, connector, id) = setup(ConnectionPoolConfig {
            idle_timeout_secs: 0,
            ..config(4, 4)
        });
        let conn = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        pools.release(conn, ReleaseOutcome::Reusable);
        assert_eq!(pools.evict_idle(), 1);

        let conn = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(connector.connects(), 2);
        drop(conn);
    }

    #[tokio::test]
    async fn deregistered_backend_drains() {
        let (registry, pools, _, id) = setup(config(4, 4));
        let parked = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        let busy = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        pools.release(parked, ReleaseOutcome::Reusable);

        registry.deregister(&id);
        pools.drain(&id);
        assert_eq!(pools.idle_count(&id), 0);
        assert!(matches!(
            pools.acquire(&id, AcquirePolicy::FailFast).await,
            Err(GatewayError::BackendUnavailable { .. })
        ));

        // in-flight work finishes, then the connection is closed, not parked
        pools.release(busy, ReleaseOutcome::Reusable);
        assert_eq!(pools.idle_count(&id), 0);
        assert!(registry.all().is_empty());
        pools.evict_idle();
        assert_eq!(pools.idle_count(&id), 0);
    }

    #[tokio::test]
    async fn dropped_connection_settles_count() {
        let (registry, pools, _, id) = setup(config(1, 1));
        let conn = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        drop(conn);
        assert_eq!(registry.snapshot(&id).unwrap().active_connections, 0);
        let conn = pools.acquire(&id, AcquirePolicy::FailFast).await.unwrap();
        pools.release(conn, ReleaseOutcome::Reusable);
    }

    #[tokio::test]
    async fn probe_bypasses_counters() {
        let (registry, pools, connector, id) = setup(config(1, 1));
        let backend = registry.get(&id).unwrap();
        pools
            .probe(&backend, ProbeKind::Connect, "/health", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(backend.active_connections(), 0);
        assert_eq!(backend.state(), HealthState::Healthy);

        connector.fail_target("10.0.0.1:80");
        assert!(pools
            .probe(&backend, ProbeKind::Connect, "/health", Duration::from_secs(1))
            .await
            .is_err());
    }
}
