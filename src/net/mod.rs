//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming connection
//!     → listener.rs (accept; preamble handshake deferred to the worker)
//!     → connection.rs (id, live-connection tracking)
//!     → dispatch pipeline
//!
//! Outgoing:
//!     connection pool → transport.rs (BackendConnector) → raw duplex stream
//!
//! Both directions frame messages with codec.rs
//! ```
//!
//! # Design Decisions
//! - The accept loop never blocks on a slow client's handshake
//! - Transport (TLS, DNS) lives behind the connector and listener traits

pub mod codec;
pub mod connection;
pub mod listener;
pub mod transport;

pub use codec::{next_frame, CodecError, FrameCodec, FrameReader, FrameWriter, FramedStream};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{
    Accepted, ChannelListener, InboundConnection, InboundListener, InboundMetadata, ListenerError,
    ProtocolKind, TcpInboundListener,
};
pub use transport::{BackendConnector, BoxedStream, DuplexStream, TcpConnector};
