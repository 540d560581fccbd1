use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use crate::filter::Address;

/// A byte stream the connection can run its filter chain over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the raw transport of a connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &Address) -> io::Result<Box<dyn AsyncStream>>;
}

/// Plain TCP, Nagle disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &Address) -> io::Result<Box<dyn AsyncStream>> {
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        stream.set_nodelay(true)?;
        trace!(%address, local = ?stream.local_addr().ok(), "tcp connected");
        Ok(Box::new(stream))
    }
}

impl fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connector")
    }
}
