//! Client configuration.
//!
//! [`ClientConfig`] gathers the daemon endpoints, credentials and the
//! tuning knobs for the dialer, session, retry and rate-limit layers.

use crate::auth::AuthMaterial;
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

use std::path::PathBuf;
use std::time::Duration;

/// Default SOCKS endpoint.
pub const DEFAULT_SOCKS_ADDR: &str = "127.0.0.1:9050";

/// Default control endpoint.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9051";

/// Provides the daemon's endpoints as `host:port` strings.
pub trait Endpoints {
    /// The SOCKS endpoint.
    fn socks_addr(&self) -> &str;
    /// The control endpoint.
    fn control_addr(&self) -> &str;
}

/// Configuration for a [`TorClient`](crate::TorClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SOCKS endpoint, `host:port`.
    pub socks_addr: String,
    /// Control endpoint, `host:port`.
    pub control_addr: String,
    /// Control-port credentials. When empty the client discovers the
    /// cookie through `PROTOCOLINFO`.
    pub auth: AuthMaterial,
    /// Timeout for opening connections.
    pub connect_timeout: Duration,
    /// Per-command timeout on the control session.
    pub command_timeout: Duration,
    /// Timeout for the SOCKS handshake.
    pub handshake_timeout: Duration,
    /// Dial attempts before giving up.
    pub retry_attempts: u32,
    /// First wait between dial attempts.
    pub retry_initial_delay: Duration,
    /// Longest wait between dial attempts.
    pub retry_max_delay: Duration,
    /// Dials per second.
    pub rate_limit: u32,
    /// Dials allowed in a burst.
    pub rate_burst: u32,
    /// Circuit rotation interval; `None` disables scheduled rotation.
    pub rotation_interval: Option<Duration>,
    /// Delay between cookie discovery attempts.
    pub cookie_discovery_interval: Duration,
    /// Overall cookie discovery budget.
    pub cookie_discovery_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socks_addr: DEFAULT_SOCKS_ADDR.to_string(),
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            auth: AuthMaterial::none(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_initial_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(5),
            rate_limit: 10,
            rate_burst: 20,
            rotation_interval: None,
            cookie_discovery_interval: Duration::from_millis(250),
            cookie_discovery_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `TOR_SOCKS_ADDR`, `TOR_CONTROL_ADDR`,
    /// `TOR_CONTROL_PASSWORD` and `TOR_COOKIE_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(addr) = get("TOR_SOCKS_ADDR") {
            config.socks_addr = addr;
        }
        if let Some(addr) = get("TOR_CONTROL_ADDR") {
            config.control_addr = addr;
        }
        if let Some(password) = get("TOR_CONTROL_PASSWORD") {
            config.auth = config.auth.with_password(password);
        }
        if let Some(path) = get("TOR_COOKIE_PATH") {
            config.auth = config.auth.with_cookie_file(PathBuf::from(path));
        }
        config
    }

    /// Set the SOCKS endpoint.
    pub fn socks_addr(mut self, addr: impl Into<String>) -> Self {
        self.socks_addr = addr.into();
        self
    }

    /// Set the control endpoint.
    pub fn control_addr(mut self, addr: impl Into<String>) -> Self {
        self.control_addr = addr.into();
        self
    }

    /// Set the control-port credentials.
    pub fn auth(mut self, auth: AuthMaterial) -> Self {
        self.auth = auth;
        self
    }

    /// Authenticate with a password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthMaterial::password(password);
        self
    }

    /// Authenticate with the cookie stored at `path`.
    pub fn cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth = AuthMaterial::cookie_file(path);
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the SOCKS handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the dial retry schedule.
    pub fn retry(mut self, attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_initial_delay = initial_delay;
        self.retry_max_delay = max_delay;
        self
    }

    /// Set the dial rate limit.
    pub fn rate_limit(mut self, per_second: u32, burst: u32) -> Self {
        self.rate_limit = per_second;
        self.rate_burst = burst;
        self
    }

    /// Enable scheduled circuit rotation.
    pub fn rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = Some(interval);
        self
    }

    /// Set cookie discovery timing.
    pub fn cookie_discovery(mut self, interval: Duration, timeout: Duration) -> Self {
        self.cookie_discovery_interval = interval;
        self.cookie_discovery_timeout = timeout;
        self
    }

    /// The retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            self.retry_initial_delay,
            self.retry_max_delay,
        )
    }

    /// A fresh rate limiter described by this configuration.
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.rate_limit, self.rate_burst)
    }

    /// Check endpoints and timeouts.
    pub fn validate(&self) -> Result<()> {
        check_endpoint("socks_addr", &self.socks_addr)?;
        check_endpoint("control_addr", &self.control_addr)?;

        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("command_timeout", self.command_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("cookie_discovery_timeout", self.cookie_discovery_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(Error::config("validate", format!("{} must be positive", name)));
            }
        }
        if self.rotation_interval == Some(Duration::ZERO) {
            return Err(Error::config("validate", "rotation_interval must be positive"));
        }
        Ok(())
    }
}

fn check_endpoint(name: &str, addr: &str) -> Result<()> {
    let valid = match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map_or(false, |p| p > 0),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::config(
            "validate",
            format!("{} '{}' is not host:port", name, addr),
        ))
    }
}

impl Endpoints for ClientConfig {
    fn socks_addr(&self) -> &str {
        &self.socks_addr
    }

    fn control_addr(&self) -> &str {
        &self.control_addr
    }
}
