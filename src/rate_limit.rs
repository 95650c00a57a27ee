//! Token-bucket rate limiter.

use crate::error::{Error, Result};

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled lazily on every observation.
///
/// The bucket starts full. `rate` is in tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter. `rate` and `burst` are floored at 1.
    pub fn new(rate: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: f64::from(rate.max(1)),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Bucket capacity.
    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;
    }

    /// Claim a token, or report how long until one is available.
    fn try_claim(&self) -> std::result::Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            // Timer resolution is 1ms; a shorter sleep would spin.
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate);
            Err(wait.max(Duration::from_millis(1)))
        }
    }

    /// Take a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        self.try_claim().is_ok()
    }

    /// Wait until a token can be claimed.
    ///
    /// Cancellation aborts the wait without consuming a token.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let delay = match self.try_claim() {
                Ok(()) => return Ok(()),
                Err(delay) => delay,
            };
            trace!(?delay, "rate limited");

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled("rate_limit")),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
