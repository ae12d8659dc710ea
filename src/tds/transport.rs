//! Byte-stream transport.
//!
//! The connection never names a concrete socket type. It talks to a boxed
//! [`AsyncStream`], which starts as whatever the [`Connector`] returned and
//! may later be replaced by a TLS stream layered over it.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::error::{codes, ConnectionError, ConnectionResult};

/// A bidirectional byte stream usable as a connection transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased transport owned by the message layer.
pub type BoxStream = Box<dyn AsyncStream>;

/// Opens the transport stream for a host and port.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> ConnectionResult<BoxStream>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> ConnectionResult<BoxStream> {
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            ConnectionError::transport(codes::ESOCKET, format!("Failed to connect to {} - {}", addr, e))
        })?;
        stream.set_nodelay(true)?;
        debug!("TCP connection established to {}", addr);
        Ok(Box::new(stream))
    }
}
