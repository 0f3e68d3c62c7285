//! In-memory collaborators for deterministic tests.
//!
//! [`MemoryConnector`] hands out `tokio::io::duplex` pipes whose far end is
//! driven by a scripted backend task.

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};

use crate::config::{ConnectionPoolConfig, IdempotencyConfig, SessionConfig};
use crate::health::HealthThresholds;
use crate::load_balancer::{AffinityTable, Backend, BackendId, BackendRegistry, BackendTarget, LoadBalancer};
use crate::net::{
    next_frame, BackendConnector, BoxedStream, CodecError, FrameCodec, FramedStream, InboundConnection, InboundMetadata,
};
use crate::observability::MemorySink;
use crate::pool::ConnectionPoolManager;
use crate::session::{ClientFrame, SessionContext};

/// Drives the backend end of one connection.
pub type BackendScript = Arc<dyn Fn(DuplexStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connector backed by in-process scripted backends, keyed by authority.
pub struct MemoryConnector {
    default: Option<BackendScript>,
    scripts: DashMap<String, BackendScript>,
    failing: DashSet<String>,
    connects: DashMap<String, usize>,
    total: AtomicUsize,
}

impl MemoryConnector {
    /// Backends with no script refuse connections.
    pub fn new() -> Self {
        Self {
            default: None,
            scripts: DashMap::new(),
            failing: DashSet::new(),
            connects: DashMap::new(),
            total: AtomicUsize::new(0),
        }
    }

    /// Every backend echoes raw bytes back.
    pub fn echo() -> Self {
        Self {
            default: Some(Arc::new(|stream| echo_bytes(stream).boxed())),
            ..Self::new()
        }
    }

    /// Install `script` for connections to `authority` (`host:port`).
    pub fn script<F, Fut>(&self, authority: &str, script: F)
    where
        F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.scripts
            .insert(authority.to_string(), Arc::new(move |stream| script(stream).boxed()));
    }

    /// Refuse connections to `authority` until [`heal_target`](Self::heal_target).
    pub fn fail_target(&self, authority: &str) {
        self.failing.insert(authority.to_string());
    }

    pub fn heal_target(&self, authority: &str) {
        self.failing.remove(authority);
    }

    /// Successful connects across all targets.
    pub fn connects(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn connects_to(&self, authority: &str) -> usize {
        self.connects.get(authority).map(|c| *c).unwrap_or(0)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendConnector for MemoryConnector {
    fn connect<'a>(&'a self, target: &'a BackendTarget) -> BoxFuture<'a, io::Result<BoxedStream>> {
        async move {
            let authority = target.authority();
            if self.failing.contains(&authority) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
            }
            let script = self
                .scripts
                .get(&authority)
                .map(|s| s.clone())
                .or_else(|| self.default.clone())
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no backend listening"))?;

            let (near, far) = tokio::io::duplex(64 * 1024);
            tokio::spawn(script(far));
            *self.connects.entry(authority).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(near) as BoxedStream)
        }
        .boxed()
    }
}

async fn echo_bytes(stream: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
}

/// Backend that answers every request frame with `prefix` + request.
pub async fn frame_responder(stream: DuplexStream, prefix: &'static [u8]) {
    let mut frames = FrameCodec::default().framed(stream);
    while let Ok(Some(frame)) = next_frame(&mut frames).await {
        let mut reply = prefix.to_vec();
        reply.extend_from_slice(&frame);
        if frames.send(Bytes::from(reply)).await.is_err() {
            break;
        }
    }
}

/// Backend that reads one opening frame, then pushes `frames` and either
/// ends cleanly (zero-length frame) or drops the connection.
pub async fn frame_pusher(stream: DuplexStream, frames: Vec<&'static [u8]>, clean_end: bool) {
    let mut framed = FrameCodec::default().framed(stream);
    if !matches!(next_frame(&mut framed).await, Ok(Some(_))) {
        return;
    }
    for frame in frames {
        if framed.send(Bytes::from_static(frame)).await.is_err() {
            return;
        }
    }
    if clean_end {
        let _ = framed.send(Bytes::new()).await;
        let _ = framed.close().await;
    }
}

/// Backend that reads one opening frame, pushes each batch `pause` apart,
/// then holds the connection open until the gateway hangs up.
pub async fn batch_pusher(stream: DuplexStream, batches: Vec<Vec<String>>, pause: Duration) {
    let mut framed = FrameCodec::default().framed(stream);
    if !matches!(next_frame(&mut framed).await, Ok(Some(_))) {
        return;
    }
    for (i, batch) in batches.into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(pause).await;
        }
        for frame in batch {
            if framed.send(Bytes::from(frame)).await.is_err() {
                return;
            }
        }
    }
    while let Ok(Some(_)) = next_frame(&mut framed).await {}
}

/// Backend that accepts the connection and never answers.
pub async fn silent(mut stream: DuplexStream) {
    let mut sink = [0u8; 1024];
    while let Ok(n) = stream.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

/// A fully wired session context over in-memory backends, all in pool `api`.
pub struct GatewayFixture {
    pub registry: Arc<BackendRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub pools: Arc<ConnectionPoolManager>,
    pub sessions: Arc<SessionContext>,
    pub events: Arc<MemorySink>,
}

/// Backends are `(id, host:port)` pairs and start HEALTHY.
pub fn gateway_fixture(connector: Arc<MemoryConnector>, backends: &[(&str, &str)]) -> GatewayFixture {
    let events = Arc::new(MemorySink::new());
    let registry = Arc::new(BackendRegistry::new(HealthThresholds::new(1, 3), events.clone()).assume_healthy());
    for (id, address) in backends {
        let target = BackendTarget::parse(address).unwrap_or_else(|e| panic!("bad test address {address}: {e}"));
        if let Err(e) = registry.register(Backend::new(BackendId::from(*id), "api", target, 1)) {
            panic!("registering {id}: {e}");
        }
    }
    let balancer = Arc::new(LoadBalancer::new(registry.clone(), AffinityTable::new(Duration::from_secs(60))));
    let pools = Arc::new(ConnectionPoolManager::new(
        registry.clone(),
        connector,
        ConnectionPoolConfig::default(),
        events.clone(),
    ));
    let sessions = Arc::new(SessionContext::new(
        balancer.clone(),
        pools.clone(),
        SessionConfig::default(),
        IdempotencyConfig::default(),
        events.clone(),
    ));
    GatewayFixture {
        registry,
        balancer,
        pools,
        sessions,
        events,
    }
}

/// An inbound connection plus the client end of its stream.
pub fn inbound(metadata: InboundMetadata) -> (DuplexStream, InboundConnection) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (client, InboundConnection::new(metadata, Box::new(server)))
}

/// Client side of a framed gateway connection.
pub struct FrameClient<S> {
    frames: FramedStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            frames: FrameCodec::default().framed(stream),
        }
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        self.frames.send(Bytes::copy_from_slice(payload)).await
    }

    /// Next gateway frame; `None` once the gateway closed the connection.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        let frame = next_frame(&mut self.frames).await.ok()??;
        ClientFrame::decode(frame).ok()
    }

    /// Collect frames until the connection closes or `limit` elapses.
    pub async fn drain(&mut self, limit: Duration) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout(limit, self.recv()).await {
            frames.push(frame);
        }
        frames
    }

    pub fn into_inner(self) -> S {
        self.frames.into_inner()
    }
}
