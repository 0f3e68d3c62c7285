//! Backend transport.
//!
//! The gateway never dials sockets directly; it asks a [`BackendConnector`]
//! for an ordered duplex byte stream. [`TcpConnector`] is the production
//! implementation.

use futures_util::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::load_balancer::BackendTarget;

/// An ordered, bidirectional byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Opens raw streams to backends.
pub trait BackendConnector: Send + Sync + 'static {
    fn connect<'a>(&'a self, target: &'a BackendTarget) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl BackendConnector for TcpConnector {
    fn connect<'a>(&'a self, target: &'a BackendTarget) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
