//! Byte-stream connection factory.
//!
//! Both the SOCKS dialer and the control session open their connections
//! through a [`Connector`], so tests and embedders can swap the transport.

use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::trace;

/// Opens bidirectional byte streams to `host:port` addresses.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The stream type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `addr`, giving up at `deadline`.
    async fn connect(&self, addr: &str, deadline: Instant) -> Result<Self::Stream>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: &str, deadline: Instant) -> Result<TcpStream> {
        trace!(addr, "opening TCP connection");
        let stream = tokio::time::timeout_at(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout("connect"))?
            .map_err(|e| Error::io("connect", e))?;
        stream.set_nodelay(true).map_err(|e| Error::io("connect", e))?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let deadline = Instant::now() + Duration::from_secs(5);
        let stream = TcpConnector.connect(&addr, deadline).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = TcpConnector.connect(&addr, deadline).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.op(), "connect");
    }
}
