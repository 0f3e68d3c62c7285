//! Accept/dispatch pipeline.
//!
//! # Responsibilities
//! - Own every long-lived component and wire them together
//! - Accept connections under a bounded worker pool
//! - Classify each connection and hand it to the matching session handler
//! - Apply reloaded configuration without dropping traffic

use futures_util::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::GatewayConfig;
use crate::dispatch::blind::forward_blind;
use crate::error::GatewayError;
use crate::health::{HealthProber, HealthThresholds};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{AffinityTable, BackendRegistry, LoadBalancer, RegistryError};
use crate::net::{BackendConnector, ConnectionTracker, InboundConnection, InboundListener, ListenerError, ProtocolKind};
use crate::observability::SharedSink;
use crate::pool::ConnectionPoolManager;
use crate::routing::{Router, RoutingMode, RuleSet};
use crate::session::stream::serve_stream;
use crate::session::unary::serve_unary;
use crate::session::{ClientFrame, EndStatus, SessionContext, SessionKind};

/// A slow or silent client may not hold a worker past this.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Error building or reconfiguring the gateway.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Rules(#[from] GatewayError),
}

/// The running data plane.
pub struct Gateway {
    registry: Arc<BackendRegistry>,
    balancer: Arc<LoadBalancer>,
    pools: Arc<ConnectionPoolManager>,
    router: Arc<Router>,
    sessions: Arc<SessionContext>,
    prober: Arc<HealthProber>,
    tracker: ConnectionTracker,
    workers: Arc<Semaphore>,
}

impl Gateway {
    /// Build every component from `config`. Backends are registered but
    /// nothing runs until [`serve`](Self::serve) and
    /// [`spawn_background`](Self::spawn_background) are called.
    pub fn new(
        config: &GatewayConfig,
        connector: Arc<dyn BackendConnector>,
        events: SharedSink,
    ) -> Result<Self, SetupError> {
        let health = &config.health_check;
        let thresholds = HealthThresholds::new(health.soft_failure_threshold, health.hard_failure_threshold);
        let registry = BackendRegistry::new(thresholds, events.clone());
        let registry = Arc::new(if health.enabled {
            registry
        } else {
            registry.assume_healthy()
        });
        registry.register_all(&config.backends)?;

        let router = Arc::new(Router::new(RuleSet::from_config(config)?));
        let balancer = Arc::new(LoadBalancer::new(
            registry.clone(),
            AffinityTable::new(config.sessions.retention()),
        ));
        let pools = Arc::new(ConnectionPoolManager::new(
            registry.clone(),
            connector,
            config.connection_pool.clone(),
            events.clone(),
        ));
        let sessions = Arc::new(SessionContext::new(
            balancer.clone(),
            pools.clone(),
            config.sessions.clone(),
            config.idempotency.clone(),
            events,
        ));
        let prober = Arc::new(HealthProber::new(registry.clone(), pools.clone(), health.clone()));

        Ok(Self {
            registry,
            balancer,
            pools,
            router,
            sessions,
            prober,
            tracker: ConnectionTracker::new(),
            workers: Arc::new(Semaphore::new(config.sessions.max_sessions.max(1))),
        })
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn sessions(&self) -> &Arc<SessionContext> {
        &self.sessions
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Start the health prober, pool reaper and bookkeeping sweeper.
    pub fn spawn_background(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let prober = tokio::spawn(self.prober.clone().run(shutdown.subscribe()));
        let reaper = tokio::spawn(self.pools.clone().run_reaper(shutdown.subscribe()));

        let sessions = self.sessions.clone();
        let balancer = self.balancer.clone();
        let mut stop = shutdown.subscribe();
        let sweeper = tokio::spawn(async move {
            let mut ticker = time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (records, streams) = sessions.sweep();
                        let pins = balancer.affinity().sweep();
                        if records + streams + pins > 0 {
                            tracing::debug!(records, streams, pins, "Swept expired session state");
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        vec![prober, reaper, sweeper]
    }

    /// Accept from `listener` until shutdown or until the listener closes.
    /// A worker permit is taken before each accept, so at most
    /// `max_sessions` connections are supervised at once.
    pub async fn serve<L: InboundListener>(self: Arc<Self>, mut listener: L, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        tracing::info!(listener = listener.name(), "Accept loop starting");

        loop {
            let permit = tokio::select! {
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = stop.recv() => break,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.recv() => break,
            };
            let accepted = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(listener = listener.name(), error = %e, "Accept failed");
                    time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let gateway = self.clone();
            let worker_shutdown = shutdown.subscribe();
            tokio::spawn(async move {
                let _permit = permit;
                let conn = match time::timeout(HANDSHAKE_TIMEOUT, accepted.handshake).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        tracing::debug!(peer = ?accepted.peer, error = %e, "Handshake failed");
                        return;
                    }
                    Err(_) => {
                        tracing::debug!(peer = ?accepted.peer, "Handshake timed out");
                        return;
                    }
                };
                gateway.dispatch(conn, worker_shutdown).await;
            });
        }

        tracing::info!(listener = listener.name(), "Accept loop stopped");
    }

    /// Classify one connection and supervise it until it closes.
    pub async fn dispatch(&self, mut conn: InboundConnection, shutdown: broadcast::Receiver<()>) -> EndStatus {
        let _guard = self.tracker.track(conn.id);
        let class = match self.router.classify(&conn.metadata) {
            Ok(class) => class,
            Err(e) => {
                tracing::warn!(connection = %conn.id, port = conn.metadata.listen_port, error = %e, "Unroutable connection");
                if conn.metadata.kind != ProtocolKind::Opaque {
                    let frame = ClientFrame::Unavailable { code: e.code().to_string() }.encode();
                    let _ = self.sessions.codec.writer(&mut conn.stream).send(frame).await;
                }
                let _ = conn.stream.shutdown().await;
                return EndStatus::Failed;
            }
        };

        tracing::debug!(
            connection = %conn.id,
            pool = %class.pool,
            route = ?class.route,
            mode = ?class.mode,
            kind = class.kind.as_str(),
            "Dispatching connection"
        );

        let ctx = &self.sessions;
        match (class.mode, class.kind) {
            (RoutingMode::Blind, _) => forward_blind(ctx, conn, &class, shutdown).await,
            (RoutingMode::ContentAware, SessionKind::Unary) => serve_unary(ctx, conn, &class, shutdown).await,
            (RoutingMode::ContentAware, SessionKind::Stream) => serve_stream(ctx, conn, &class, shutdown).await,
        }
    }

    /// Apply a reloaded configuration: swap the rule set, then reconcile
    /// backends. A rule set that fails to compile leaves everything unchanged.
    pub fn apply_config(&self, config: &GatewayConfig) -> Result<(), SetupError> {
        let rules = RuleSet::from_config(config)?;
        self.router.reload(rules);
        self.registry.reconcile(&config.backends)?;

        let draining: Vec<_> = self.registry.all().into_iter().filter(|b| b.draining).collect();
        for backend in &draining {
            self.pools.drain(&backend.id);
        }
        tracing::info!(
            backends = config.backends.len(),
            draining = draining.len(),
            routes = config.routes.len(),
            "Configuration applied"
        );
        Ok(())
    }

    /// Wait for supervised connections to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = self.tracker.wait_for_drain(timeout).await;
        if !drained {
            tracing::warn!(remaining = self.tracker.active_count(), "Drain timeout, closing remaining sessions");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::net::{ChannelListener, InboundMetadata};
    use crate::observability::MemorySink;
    use crate::testing::{self, frame_responder, FrameClient, MemoryConnector};
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    const CONFIG: &str = r#"
        [routing]
        default_pool = "api"

        [[routes]]
        name = "events"
        path_prefix = "/events"
        pool = "push"
        priority = 10

        [[backends]]
        name = "a"
        group = "api"
        address = "10.0.0.1:80"

        [[backends]]
        name = "b"
        group = "api"
        address = "10.0.0.2:80"

        [[backends]]
        name = "p"
        group = "push"
        address = "10.0.1.1:80"

        [health_check]
        enabled = false

        [sessions]
        max_sessions = 2
    "#;

    fn gateway(connector: Arc<MemoryConnector>) -> Arc<Gateway> {
        let config = parse_config(CONFIG).unwrap();
        Arc::new(Gateway::new(&config, connector, Arc::new(MemorySink::new())).unwrap())
    }

    #[tokio::test]
    async fn unary_connections_reach_the_default_pool() {
        let connector = Arc::new(MemoryConnector::new());
        connector.script("10.0.0.1:80", |s| frame_responder(s, b"api:"));
        connector.script("10.0.0.2:80", |s| frame_responder(s, b"api:"));
        let gateway = gateway(connector);
        let shutdown = Shutdown::new();

        let (tx, listener) = ChannelListener::new("mem", 4);
        let server = tokio::spawn(gateway.clone().serve(listener, shutdown.clone()));

        let (client, conn) = testing::inbound(InboundMetadata::application(80, "/rpc", ProtocolKind::Unary));
        tx.send(conn).await.unwrap();
        let mut client = FrameClient::new(client);
        client.send(b"ping").await.unwrap();
        assert_eq!(client.recv().await, Some(ClientFrame::Response(Bytes::from_static(b"api:ping"))));

        shutdown.trigger();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn routes_pick_the_stream_pool() {
        let connector = Arc::new(MemoryConnector::new());
        connector.script("10.0.1.1:80", |s| testing::frame_pusher(s, vec![&b"hello"[..]], true));
        let gateway = gateway(connector.clone());
        let shutdown = Shutdown::new();

        let (client, conn) = testing::inbound(InboundMetadata::application(80, "/events/feed", ProtocolKind::EventStream));
        let worker = {
            let gateway = gateway.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { gateway.dispatch(conn, rx).await })
        };
        let mut client = FrameClient::new(client);
        client.send(b"subscribe").await.unwrap();
        assert_eq!(
            client.recv().await,
            Some(ClientFrame::Data {
                seq: 1,
                payload: Bytes::from_static(b"hello")
            })
        );
        assert_eq!(client.recv().await, Some(ClientFrame::End(EndStatus::Clean)));
        assert_eq!(worker.await.unwrap(), EndStatus::Clean);
        assert_eq!(connector.connects_to("10.0.1.1:80"), 1);
        assert_eq!(gateway.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn unbound_opaque_port_is_closed() {
        let gateway = gateway(Arc::new(MemoryConnector::echo()));
        let shutdown = Shutdown::new();
        let (_client, conn) = testing::inbound(InboundMetadata::opaque(9999));
        assert_eq!(gateway.dispatch(conn, shutdown.subscribe()).await, EndStatus::Failed);

        gateway.router().bind_port(9999, "api");
        let (mut client, conn) = testing::inbound(InboundMetadata::opaque(9999));
        let worker = {
            let gateway = gateway.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { gateway.dispatch(conn, rx).await })
        };
        client.write_all(b"opaque").await.unwrap();
        let mut echoed = [0u8; 6];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"opaque");
        drop(client);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrent_sessions() {
        let connector = Arc::new(MemoryConnector::new());
        connector.script("10.0.1.1:80", testing::silent);
        let gateway = gateway(connector);
        let shutdown = Shutdown::new();

        let (tx, listener) = ChannelListener::new("mem", 4);
        let server = tokio::spawn(gateway.clone().serve(listener, shutdown.clone()));

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, conn) =
                testing::inbound(InboundMetadata::application(80, "/events", ProtocolKind::EventStream));
            tx.send(conn).await.unwrap();
            clients.push(client);
        }
        for _ in 0..20 {
            tokio::task::yield_now().await;
            time::sleep(Duration::from_millis(5)).await;
        }
        // max_sessions = 2; the third connection waits in the listener queue
        assert_eq!(gateway.tracker().active_count(), 2);

        drop(clients);
        shutdown.trigger();
        server.await.unwrap();
        assert!(gateway.drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn reload_swaps_rules_and_drains_removed_backends() {
        let gateway = gateway(Arc::new(MemoryConnector::echo()));
        let reloaded = parse_config(
            r#"
            [routing]
            default_pool = "api"

            [[backends]]
            name = "a"
            group = "api"
            address = "10.0.0.1:80"

            [[backends]]
            name = "c"
            group = "api"
            address = "10.0.0.3:80"
            weight = 3

            [health_check]
            enabled = false
            "#,
        )
        .unwrap();

        gateway.apply_config(&reloaded).unwrap();
        let ids: Vec<String> = gateway
            .registry()
            .list("api")
            .into_iter()
            .map(|b| b.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
        assert!(gateway.registry().list("push").is_empty());
        assert!(gateway.router().rules().is_empty());

        let class = gateway
            .router()
            .classify(&InboundMetadata::application(80, "/events", ProtocolKind::EventStream))
            .unwrap();
        assert_eq!(class.pool, "api");
    }

    #[tokio::test]
    async fn reload_with_bad_rules_changes_nothing() {
        let gateway = gateway(Arc::new(MemoryConnector::echo()));
        let mut broken = parse_config(CONFIG).unwrap();
        broken.routing.default_pool = None;
        broken.backends.clear();

        assert!(gateway.apply_config(&broken).is_err());
        assert_eq!(gateway.registry().list("api").len(), 2);
        assert_eq!(gateway.router().rules().len(), 1);
    }
}
