//! Client orchestrator.
//!
//! [`TorClient`] is the composition root: outbound dials go through the
//! rate limiter and the retry policy to the SOCKS dialer, management calls
//! go through one shared, lazily connected control session.

use crate::auth::AuthMaterial;
use crate::config::ClientConfig;
use crate::connector::{Connector, TcpConnector};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::onion::HiddenServiceManager;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::scheduler::{CircuitRotator, IdentityRotation};
use crate::session::{ControlSession, CookieDiscovery};
use crate::socks::SocksDialer;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

struct Inner<C: Connector> {
    config: ClientConfig,
    connector: C,
    dialer: SocksDialer<C>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    session: Mutex<Option<Arc<ControlSession<C::Stream>>>>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
}

impl<C: Connector + Clone> Inner<C> {
    async fn session(&self) -> Result<Arc<ControlSession<C::Stream>>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if !session.is_closed().await {
                return Ok(Arc::clone(session));
            }
            debug!("control session was closed, reconnecting");
        }
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled("session"));
        }

        let start = Instant::now();
        let result = self.open_session().await;
        self.metrics
            .record("control_connect", start.elapsed(), result.is_ok());

        let session = Arc::new(result?);
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn open_session(&self) -> Result<ControlSession<C::Stream>> {
        let config = &self.config;
        let auth = if config.auth.is_empty() {
            let cookie = CookieDiscovery::with_connector(self.connector.clone(), &config.control_addr)
                .interval(config.cookie_discovery_interval)
                .timeout(config.cookie_discovery_timeout)
                .attempt_timeout(config.connect_timeout + config.command_timeout)
                .discover(&self.cancel)
                .await?;
            AuthMaterial::cookie(cookie)
        } else {
            config.auth.clone()
        };

        let session = ControlSession::connect_with(
            &self.connector,
            &config.control_addr,
            auth,
            config.command_timeout,
        )
        .await?;
        if let Err(e) = session.authenticate().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}

#[async_trait]
impl<C: Connector + Clone> IdentityRotation for Inner<C> {
    async fn new_identity(&self) -> Result<()> {
        let start = Instant::now();
        let result = match self.session().await {
            Ok(session) => session.new_identity().await,
            Err(e) => Err(e),
        };
        self.metrics
            .record("new_identity", start.elapsed(), result.is_ok());
        result
    }
}

/// Handle to a Tor daemon: SOCKS dialing plus control-port management.
///
/// Cloning is cheap; clones share the session, limiter and scheduler.
pub struct TorClient<C: Connector = TcpConnector> {
    inner: Arc<Inner<C>>,
    rotator: CircuitRotator,
}

impl<C: Connector> Clone for TorClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            rotator: self.rotator.clone(),
        }
    }
}

impl TorClient<TcpConnector> {
    /// Create a client that reaches the daemon over TCP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: Connector + Clone> TorClient<C> {
    /// Create a client over a custom connector.
    pub fn with_connector(config: ClientConfig, connector: C) -> Result<Self> {
        Self::with_metrics(config, connector, Arc::new(NoopMetrics))
    }

    /// Create a client that reports to `metrics`.
    pub fn with_metrics(
        config: ClientConfig,
        connector: C,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let dialer = SocksDialer::with_connector(connector.clone(), &config.socks_addr)
            .connect_timeout(config.connect_timeout)
            .handshake_timeout(config.handshake_timeout);
        let retry = config
            .retry_policy()
            .with_retryable(|e| !e.is_terminal() && e.kind() != ErrorKind::Config);

        let inner = Arc::new(Inner {
            limiter: config.rate_limiter(),
            config,
            connector,
            dialer,
            retry,
            session: Mutex::new(None),
            metrics,
            cancel: CancellationToken::new(),
        });
        let rotator = CircuitRotator::new(Arc::clone(&inner) as Arc<dyn IdentityRotation>);

        Ok(Self { inner, rotator })
    }

    /// The configuration this client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Root cancellation token; cancelled by [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Open a tunnelled connection to `host:port`.
    ///
    /// Waits for the rate limiter, then dials with retries.
    pub async fn dial(&self, host: &str, port: u16) -> Result<C::Stream> {
        let inner = &self.inner;
        let start = Instant::now();

        let result = async {
            inner.limiter.wait(&inner.cancel).await?;
            inner
                .retry
                .run(&inner.cancel, |attempt| {
                    trace!(attempt, host, port, "dialing");
                    inner.dialer.dial(host, port)
                })
                .await
        }
        .await;

        inner.metrics.record("dial", start.elapsed(), result.is_ok());
        result
    }

    /// The shared control session, connected and authenticated.
    ///
    /// Connects on first use and again after the session was closed. With
    /// no credentials configured the cookie is discovered first.
    pub async fn session(&self) -> Result<Arc<ControlSession<C::Stream>>> {
        self.inner.session().await
    }

    /// Hidden service manager over the shared session.
    pub async fn hidden_services(&self) -> Result<HiddenServiceManager<C::Stream>> {
        Ok(HiddenServiceManager::new(self.session().await?))
    }

    /// The circuit rotation scheduler.
    pub fn rotator(&self) -> &CircuitRotator {
        &self.rotator
    }

    /// Start scheduled rotation with the configured interval.
    pub fn start_rotation(&self) -> Result<()> {
        let interval = self.inner.config.rotation_interval.ok_or_else(|| {
            Error::config("start_rotation", "no rotation interval configured")
        })?;
        self.rotator.start(interval, &self.inner.cancel)
    }

    /// Request new circuits now.
    pub async fn new_identity(&self) -> Result<()> {
        self.rotator.rotate_now().await
    }

    /// Cancel pending waits, stop rotation and close the session.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.rotator.stop();
        if let Some(session) = self.inner.session.lock().await.take() {
            session.close().await;
        }
        info!("client shut down");
    }
}
