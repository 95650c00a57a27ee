//! SOCKS5 tunnel dialer.
//!
//! Negotiates "no authentication" with the SOCKS endpoint and issues a
//! version-5 CONNECT. The stream is handed back only after the whole
//! handshake succeeds.

use crate::connector::{Connector, TcpConnector};
use crate::error::{Error, ErrorKind, Result};

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Non-zero reply status from the SOCKS endpoint.
///
/// Attached as the cause of the [`ErrorKind::Dial`](crate::ErrorKind::Dial)
/// error returned by [`SocksDialer::dial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[error("SOCKS reply {code:#04x} ({})", describe_reply(.code))]
pub struct SocksReplyError {
    /// The raw status byte.
    pub code: u8,
}

impl SocksReplyError {
    /// Extract the reply status from a dial error, if it carries one.
    pub fn from_error(err: &Error) -> Option<u8> {
        std::error::Error::source(err)?
            .downcast_ref::<SocksReplyError>()
            .map(|e| e.code)
    }
}

fn describe_reply(code: &u8) -> &'static str {
    match *code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Build the CONNECT request for `host:port`.
///
/// IP literals are encoded as addresses; anything else is sent as a domain
/// name and resolved by the proxy.
pub fn build_connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            let len = u8::try_from(name.len()).map_err(|_| {
                Error::config(
                    "dial",
                    format!("hostname is {} bytes, limit is 255", name.len()),
                )
            })?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(name);
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn handshake_io(err: std::io::Error) -> Error {
    Error::io("socks_handshake", err)
}

/// Run the SOCKS5 handshake over `stream` with a prebuilt CONNECT request.
pub async fn negotiate<S>(stream: &mut S, request: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
        .await
        .map_err(handshake_io)?;

    let mut selection = [0u8; 2];
    stream
        .read_exact(&mut selection)
        .await
        .map_err(handshake_io)?;
    if selection[0] != SOCKS_VERSION {
        return Err(Error::dial(
            "socks_handshake",
            format!("unexpected SOCKS version {:#04x}", selection[0]),
        ));
    }
    if selection[1] != METHOD_NO_AUTH {
        return Err(Error::dial(
            "socks_handshake",
            format!("proxy selected unsupported method {:#04x}", selection[1]),
        ));
    }

    stream.write_all(request).await.map_err(handshake_io)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(handshake_io)?;
    if header[1] != 0x00 {
        let reply = SocksReplyError { code: header[1] };
        return Err(Error::dial("socks_connect", reply.to_string()).with_source(reply));
    }

    // Bound address and port are not interesting to a client.
    let trailing = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(handshake_io)?;
            len[0] as usize + 2
        }
        other => {
            return Err(Error::protocol(
                "socks_connect",
                format!("unknown address type {:#04x} in reply", other),
            ))
        }
    };
    let mut discard = [0u8; 255 + 2];
    stream
        .read_exact(&mut discard[..trailing])
        .await
        .map_err(handshake_io)?;

    Ok(())
}

/// Dials TCP targets through a SOCKS5 endpoint.
///
/// Every call opens a fresh connection; nothing is shared between dials.
#[derive(Debug, Clone)]
pub struct SocksDialer<C = TcpConnector> {
    connector: C,
    proxy_addr: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl SocksDialer<TcpConnector> {
    /// Dial through the SOCKS endpoint at `proxy_addr` over TCP.
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self::with_connector(TcpConnector, proxy_addr)
    }
}

impl<C: Connector> SocksDialer<C> {
    /// Dial through `proxy_addr` using `connector`.
    pub fn with_connector(connector: C, proxy_addr: impl Into<String>) -> Self {
        Self {
            connector,
            proxy_addr: proxy_addr.into(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
        }
    }

    /// Timeout for reaching the SOCKS endpoint.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Timeout for the handshake, which includes the remote connect.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The SOCKS endpoint address.
    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Open a tunnelled connection to `host:port`.
    pub async fn dial(&self, host: &str, port: u16) -> Result<C::Stream> {
        let request = build_connect_request(host, port)?;

        let mut stream = self
            .connector
            .connect(&self.proxy_addr, Instant::now() + self.connect_timeout)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::Cancelled {
                    return e.in_op("dial");
                }
                Error::dial("dial", format!("cannot reach SOCKS endpoint {}", self.proxy_addr))
                    .with_source(e)
            })?;
        trace!(proxy = %self.proxy_addr, host, port, "SOCKS endpoint connected");

        let deadline = Instant::now() + self.handshake_timeout;
        let result = match tokio::time::timeout_at(deadline, negotiate(&mut stream, &request)).await
        {
            Ok(result) => result,
            // Dial rather than Timeout, which retry treats as final.
            Err(_) => Err(Error::dial(
                "socks_handshake",
                format!("no handshake reply within {:?}", self.handshake_timeout),
            )
            .with_source(Error::timeout("socks_handshake"))),
        };

        if let Err(e) = result {
            let _ = stream.shutdown().await;
            return Err(e);
        }
        debug!(host, port, "SOCKS tunnel established");
        Ok(stream)
    }
}
