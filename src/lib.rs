//! # torwire
//!
//! Async client for the two wire protocols a Tor daemon exposes:
//!
//! - the SOCKS5 endpoint, for tunnelling TCP connections through the
//!   network ([`SocksDialer`]);
//! - the control endpoint, for authenticating, querying configuration,
//!   rotating circuits and provisioning onion services
//!   ([`ControlSession`], [`HiddenServiceManager`], [`CircuitRotator`]).
//!
//! [`TorClient`] ties these together with a token-bucket [`RateLimiter`]
//! and an exponential-backoff [`RetryPolicy`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use torwire::{ClientConfig, Result, TorClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = TorClient::new(ClientConfig::from_env())?;
//!
//!     let session = client.session().await?;
//!     println!("Connected to Tor {}", session.get_version().await?);
//!
//!     let _stream = client.dial("example.com", 80).await?;
//!
//!     client.new_identity().await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Authentication
//!
//! Credentials are given as [`AuthMaterial`]. A password wins over a
//! cookie file, which wins over raw cookie bytes. With no credentials the
//! client asks the daemon where its cookie lives and retries until the
//! cookie authenticates:
//!
//! ```rust,no_run
//! use torwire::{AuthMaterial, ClientConfig, TorClient};
//!
//! # async fn example() -> torwire::Result<()> {
//! let config = ClientConfig::new()
//!     .control_addr("127.0.0.1:9051")
//!     .auth(AuthMaterial::cookie_file("/run/tor/control.authcookie"));
//! let client = TorClient::new(config)?;
//! client.session().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Onion Services
//!
//! ```rust,no_run
//! use torwire::{ClientConfig, OnionServiceConfig, TorClient};
//!
//! # async fn example() -> torwire::Result<()> {
//! # let client = TorClient::new(ClientConfig::new())?;
//! let services = client.hidden_services().await?;
//! let service = services
//!     .provision(&OnionServiceConfig::new().port(80, 8080))
//!     .await?;
//! println!("Serving at {}", service.address());
//!
//! services.deprovision(&service).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod onion;
pub mod protocol;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod socks;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use auth::{AuthMaterial, AuthMethod, ProtocolInfo};
pub use client::TorClient;
pub use config::{ClientConfig, Endpoints};
pub use connector::{Connector, TcpConnector};
pub use error::{Error, ErrorKind, Result, StatusCode};
pub use metrics::{MetricsSink, NoopMetrics};
pub use onion::{ClientAuth, HiddenService, HiddenServiceManager, OnionServiceConfig};
pub use protocol::{DataBlock, Reply, ReplyLine};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use scheduler::{CircuitRotator, IdentityRotation};
pub use session::{ControlSession, CookieDiscovery};
pub use socks::{SocksDialer, SocksReplyError};
pub use types::{
    CircuitId, CircuitInfo, CircuitPurpose, CircuitStatus, Fingerprint, OnionAddress, ServerSpec,
    Signal, StreamId, StreamInfo, StreamStatus, TorVersion,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Control protocol version spoken by [`ControlSession`].
pub const PROTOCOL_VERSION: u32 = 1;
