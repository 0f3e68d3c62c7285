//! Shared utilities for integration tests: real TCP backends and a gateway
//! bound to an ephemeral port.

#![allow(dead_code)]

use bytes::Bytes;
use futures_util::SinkExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use stream_gateway::config::{parse_config, ListenerConfig, ListenerMode};
use stream_gateway::net::{next_frame, FrameCodec, InboundMetadata, TcpConnector, TcpInboundListener};
use stream_gateway::observability::MemorySink;
use stream_gateway::testing::FrameClient;
use stream_gateway::{Gateway, Shutdown};

/// Start a mock backend on an ephemeral port; `handler` runs per accepted connection.
pub async fn start_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handler(socket));
        }
    });
    addr
}

/// Answer each request frame with `prefix` + request.
pub async fn respond_with_prefix(stream: TcpStream, prefix: &'static [u8]) {
    let mut frames = FrameCodec::default().framed(stream);
    while let Ok(Some(frame)) = next_frame(&mut frames).await {
        let mut reply = prefix.to_vec();
        reply.extend_from_slice(&frame);
        if frames.send(Bytes::from(reply)).await.is_err() {
            break;
        }
    }
}

/// Read the opening frame, push `frames`, then end cleanly or drop the connection.
pub async fn push_frames(stream: TcpStream, frames: Vec<String>, clean_end: bool) {
    let mut framed = FrameCodec::default().framed(stream);
    if !matches!(next_frame(&mut framed).await, Ok(Some(_))) {
        return;
    }
    for frame in frames {
        if framed.send(Bytes::from(frame)).await.is_err() {
            return;
        }
    }
    if clean_end {
        let _ = framed.send(Bytes::new()).await;
    }
}

/// Read the opening frame, push each batch `pause` apart, then hold the connection open.
pub async fn push_batches(stream: TcpStream, batches: Vec<Vec<String>>, pause: Duration) {
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

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A running gateway with one application-mode listener.
pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

impl TestGateway {
    /// Build from TOML, start background tasks and an application listener.
    pub async fn start(config: &str) -> Self {
        let config = parse_config(config).unwrap();
        let gateway = Arc::new(Gateway::new(&config, Arc::new(TcpConnector), Arc::new(MemorySink::new())).unwrap());
        let shutdown = Shutdown::new();
        gateway.spawn_background(&shutdown);

        let listener = TcpInboundListener::bind(
            &ListenerConfig {
                name: "test".to_string(),
                bind_address: "127.0.0.1:0".to_string(),
                mode: ListenerMode::Application,
                pool: None,
            },
            FrameCodec::new(config.sessions.max_frame_bytes),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(gateway.clone().serve(listener, shutdown.clone()));

        Self { gateway, addr, shutdown }
    }

    /// Bind a transport listener routed to `pool`.
    pub async fn bind_transport(&self, pool: &str) -> SocketAddr {
        let listener = TcpInboundListener::bind(
            &ListenerConfig {
                name: "raw".to_string(),
                bind_address: "127.0.0.1:0".to_string(),
                mode: ListenerMode::Transport,
                pool: Some(pool.to_string()),
            },
            FrameCodec::default(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        self.gateway.router().bind_port(addr.port(), pool);
        tokio::spawn(self.gateway.clone().serve(listener, self.shutdown.clone()));
        addr
    }

    /// Open a framed connection and send its metadata preamble.
    pub async fn connect(&self, metadata: &InboundMetadata) -> FrameClient<TcpStream> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let preamble = serde_json::to_vec(metadata).unwrap();
        FrameCodec::default()
            .writer(&mut stream)
            .send(Bytes::from(preamble))
            .await
            .unwrap();
        FrameClient::new(stream)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
