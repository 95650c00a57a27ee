//! Exponential-backoff retry executor.

use crate::error::{Error, Result};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

const MIN_DELAY: Duration = Duration::from_millis(1);

/// Retry policy: attempt ceiling, doubling delay with a ceiling, and a
/// retryability predicate. Holds no per-call state.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    retryable: RetryPredicate,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is floored at 1, `initial_delay` at
    /// 1ms, and `max_delay` is raised to at least `initial_delay`.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        let initial_delay = initial_delay.max(MIN_DELAY);
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            retryable: Arc::new(|e: &Error| !e.is_terminal()),
        }
    }

    /// Replace the retryability predicate.
    ///
    /// The default retries everything except cancellation and deadline
    /// expiry.
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    /// Attempt ceiling.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after the first failure.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Longest single wait.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether `err` may be retried under this policy.
    pub fn is_retryable(&self, err: &Error) -> bool {
        (self.retryable)(err)
    }

    /// The waits between attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut current = self.initial_delay;
        (1..self.max_attempts).map(move |_| {
            let wait = current.min(self.max_delay);
            current = current.saturating_mul(2);
            wait
        })
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt ceiling is reached. `op` receives the 1-based attempt number.
    ///
    /// The last failure is returned unchanged.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = self.delays();
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled("retry"));
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.is_retryable(&err) {
                return Err(err);
            }
            let Some(delay) = delays.next() else {
                return Err(err);
            };

            debug!(
                attempt,
                max_attempts = self.max_attempts,
                ?delay,
                error = %err,
                "attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled("retry")),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_secs(5))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}
