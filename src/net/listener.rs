//! Inbound listeners.
//!
//! # Responsibilities
//! - Accept inbound connections (TCP or in-process channel)
//! - Defer per-connection handshakes (metadata preamble) to the worker task
//! - Describe each connection with [`InboundMetadata`]
//!
//! Transport-mode TCP listeners hand over the raw stream with `Opaque`
//! metadata. Application-mode listeners expect one length-delimited JSON
//! preamble frame:
//!
//! ```json
//! {"path": "/events", "host": "api.example", "headers": {"x-session-id": "s1"},
//!  "kind": "event_stream", "keep_alive": false}
//! ```

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::{ListenerConfig, ListenerMode};
use crate::net::codec::{next_frame, CodecError, FrameCodec};
use crate::net::connection::ConnectionId;
use crate::net::transport::BoxedStream;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(std::io::Error),
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),
    /// The listener will not produce more connections.
    #[error("listener closed")]
    Closed,
    /// The connection's metadata preamble was missing or malformed.
    #[error("bad preamble: {0}")]
    Preamble(String),
}

impl From<CodecError> for ListenerError {
    fn from(e: CodecError) -> Self {
        ListenerError::Preamble(e.to_string())
    }
}

/// Wire protocol shape declared by an inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Raw byte stream, never inspected.
    Opaque,
    /// Request/response.
    Unary,
    /// Server push (SSE style).
    EventStream,
    /// Long-poll; reconnects resume from the last seen sequence.
    LongPoll,
    /// Client and backend both send frames for the lifetime of the session.
    Multiplexed,
}

/// Routing-relevant description of an inbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMetadata {
    /// Local port the connection arrived on.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub host: Option<String>,
    /// Header names are lowercased on construction.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub kind: ProtocolKind,
    #[serde(default)]
    pub keep_alive: bool,
}

impl InboundMetadata {
    /// Metadata for a blind transport connection.
    pub fn opaque(listen_port: u16) -> Self {
        Self {
            listen_port,
            path: String::new(),
            host: None,
            headers: HashMap::new(),
            kind: ProtocolKind::Opaque,
            keep_alive: false,
        }
    }

    /// Metadata for a framed application connection.
    pub fn application(listen_port: u16, path: impl Into<String>, kind: ProtocolKind) -> Self {
        Self {
            listen_port,
            path: path.into(),
            host: None,
            headers: HashMap::new(),
            kind,
            keep_alive: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn normalize(mut self) -> Self {
        self.headers = self
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        self
    }
}

/// An accepted, described, ready-to-route connection.
pub struct InboundConnection {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub metadata: InboundMetadata,
    pub stream: BoxedStream,
    /// Bytes read past the preamble, ahead of `stream`.
    pub buffered: BytesMut,
}

impl InboundConnection {
    pub fn new(metadata: InboundMetadata, stream: BoxedStream) -> Self {
        Self {
            id: ConnectionId::new(),
            peer: None,
            metadata,
            stream,
            buffered: BytesMut::new(),
        }
    }
}

/// A connection whose handshake has not run yet.
pub struct Accepted {
    pub peer: Option<SocketAddr>,
    pub handshake: BoxFuture<'static, Result<InboundConnection, ListenerError>>,
}

impl Accepted {
    /// A connection that needs no handshake.
    pub fn ready(connection: InboundConnection) -> Self {
        Self {
            peer: connection.peer,
            handshake: Box::pin(async move { Ok(connection) }),
        }
    }
}

/// Source of inbound connections.
pub trait InboundListener: Send + 'static {
    fn accept(&mut self) -> BoxFuture<'_, Result<Accepted, ListenerError>>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// TCP listener in transport or application mode.
pub struct TcpInboundListener {
    name: String,
    inner: TcpListener,
    mode: ListenerMode,
    codec: FrameCodec,
    port: u16,
}

impl TcpInboundListener {
    /// Bind to the configured address.
    pub async fn bind(config: &ListenerConfig, codec: FrameCodec) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind(&config.bind_address)
            .await
            .map_err(ListenerError::Bind)?;
        let local_addr = inner.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            listener = %config.name,
            address = %local_addr,
            mode = ?config.mode,
            "Listener bound"
        );

        Ok(Self {
            name: config.name.clone(),
            inner,
            mode: config.mode,
            codec,
            port: local_addr.port(),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}

impl InboundListener for TcpInboundListener {
    fn accept(&mut self) -> BoxFuture<'_, Result<Accepted, ListenerError>> {
        Box::pin(async move {
            let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;
            let _ = stream.set_nodelay(true);
            tracing::debug!(listener = %self.name, peer_addr = %peer, "Connection accepted");

            let port = self.port;
            let codec = self.codec;
            let handshake: BoxFuture<'static, Result<InboundConnection, ListenerError>> = match self.mode {
                ListenerMode::Transport => Box::pin(async move {
                    let mut conn = InboundConnection::new(InboundMetadata::opaque(port), Box::new(stream));
                    conn.peer = Some(peer);
                    Ok(conn)
                }),
                ListenerMode::Application => Box::pin(async move {
                    let mut frames = codec.framed(Box::new(stream) as BoxedStream);
                    let metadata = read_preamble(&mut frames, port).await?;
                    let parts = frames.into_parts();
                    let mut conn = InboundConnection::new(metadata, parts.io);
                    conn.buffered = parts.read_buf;
                    conn.peer = Some(peer);
                    Ok(conn)
                }),
            };

            Ok(Accepted {
                peer: Some(peer),
                handshake,
            })
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decode the JSON metadata preamble from the first frame.
pub async fn read_preamble<S>(frames: &mut S, port: u16) -> Result<InboundMetadata, ListenerError>
where
    S: futures_util::Stream<Item = Result<bytes::Bytes, CodecError>> + Unpin,
{
    let frame = next_frame(frames)
        .await?
        .ok_or_else(|| ListenerError::Preamble("connection closed before preamble".into()))?;
    let mut metadata: InboundMetadata =
        serde_json::from_slice(&frame).map_err(|e| ListenerError::Preamble(e.to_string()))?;
    if metadata.kind == ProtocolKind::Opaque {
        return Err(ListenerError::Preamble("opaque kind on an application listener".into()));
    }
    metadata.listen_port = port;
    Ok(metadata.normalize())
}

/// In-process listener fed through a channel.
pub struct ChannelListener {
    name: String,
    rx: mpsc::Receiver<InboundConnection>,
}

impl ChannelListener {
    pub fn new(name: impl Into<String>, capacity: usize) -> (mpsc::Sender<InboundConnection>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                name: name.into(),
                rx,
            },
        )
    }
}

impl InboundListener for ChannelListener {
    fn accept(&mut self) -> BoxFuture<'_, Result<Accepted, ListenerError>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(connection) => Ok(Accepted::ready(connection)),
                None => Err(ListenerError::Closed),
            }
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use futures_util::SinkExt;

    #[tokio::test]
    async fn preamble_is_decoded_and_normalized() {
        let codec = FrameCodec::new(1024);
        let (client, server) = tokio::io::duplex(1024);
        let body = br#"{"path":"/events","headers":{"X-Session-Id":"s1"},"kind":"long_poll"}"#;
        codec.writer(client).send(Bytes::from_static(body)).await.unwrap();

        let meta = read_preamble(&mut codec.reader(server), 8080).await.unwrap();
        assert_eq!(meta.listen_port, 8080);
        assert_eq!(meta.kind, ProtocolKind::LongPoll);
        assert_eq!(meta.header("x-session-id"), Some("s1"));
        assert!(!meta.keep_alive);
    }

    #[tokio::test]
    async fn opaque_preamble_is_rejected() {
        let codec = FrameCodec::new(1024);
        let (client, server) = tokio::io::duplex(1024);
        codec
            .writer(client)
            .send(Bytes::from_static(br#"{"kind":"opaque"}"#))
            .await
            .unwrap();
        assert!(matches!(
            read_preamble(&mut codec.reader(server), 1).await,
            Err(ListenerError::Preamble(_))
        ));
    }

    #[tokio::test]
    async fn frames_sent_with_the_preamble_are_kept() {
        let mut listener = TcpInboundListener::bind(
            &ListenerConfig {
                name: "app".to_string(),
                bind_address: "127.0.0.1:0".to_string(),
                mode: ListenerMode::Application,
                pool: None,
            },
            FrameCodec::default(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut frames = FrameCodec::default().framed(stream);
            // preamble and first request leave in one write
            frames
                .feed(Bytes::from_static(br#"{"path":"/rpc","kind":"unary"}"#))
                .await
                .unwrap();
            frames.feed(Bytes::from_static(b"hello")).await.unwrap();
            frames.flush().await.unwrap();
            frames
        });

        let accepted = listener.accept().await.unwrap();
        let conn = accepted.handshake.await.unwrap();
        assert_eq!(conn.metadata.kind, ProtocolKind::Unary);
        let (mut reader, _writer) = FrameCodec::default().split(conn.stream, conn.buffered);
        assert_eq!(next_frame(&mut reader).await.unwrap(), Some(Bytes::from_static(b"hello")));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn channel_listener_closes() {
        let (tx, mut listener) = ChannelListener::new("mem", 1);
        let (a, _b) = tokio::io::duplex(16);
        tx.send(InboundConnection::new(InboundMetadata::opaque(1), Box::new(a)))
            .await
            .unwrap();
        drop(tx);

        let accepted = listener.accept().await.unwrap();
        let conn = accepted.handshake.await.unwrap();
        assert_eq!(conn.metadata.kind, ProtocolKind::Opaque);
        assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
    }
}
