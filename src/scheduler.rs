//! Background circuit rotation.
//!
//! [`CircuitRotator`] is either idle or running exactly one background task
//! that requests a new identity every interval. Starting while running is
//! rejected; stopping while idle does nothing.

use crate::error::{Error, Result};
use crate::session::ControlSession;

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something that can switch to fresh circuits.
#[async_trait]
pub trait IdentityRotation: Send + Sync + 'static {
    /// Ask for new circuits for future streams.
    async fn new_identity(&self) -> Result<()>;
}

#[async_trait]
impl<S> IdentityRotation for ControlSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn new_identity(&self) -> Result<()> {
        ControlSession::new_identity(self).await
    }
}

struct Running {
    generation: u64,
    interval: Duration,
    stop: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct State {
    running: Option<Running>,
    generation: u64,
}

/// Periodic new-identity scheduler.
#[derive(Clone)]
pub struct CircuitRotator {
    target: Arc<dyn IdentityRotation>,
    state: Arc<Mutex<State>>,
}

impl CircuitRotator {
    /// An idle rotator driving `target`.
    pub fn new(target: Arc<dyn IdentityRotation>) -> Self {
        Self {
            target,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a rotation loop is active.
    pub fn is_running(&self) -> bool {
        self.state().running.is_some()
    }

    /// The active interval, if running.
    pub fn interval(&self) -> Option<Duration> {
        self.state().running.as_ref().map(|r| r.interval)
    }

    /// Start rotating every `interval`.
    ///
    /// The loop ends on [`stop`](Self::stop) or when `cancel` fires. It runs
    /// on the current tokio runtime; calling this outside one is a
    /// [`Config`](crate::ErrorKind::Config) error.
    pub fn start(&self, interval: Duration, cancel: &CancellationToken) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::config("start_rotation", "interval must be positive"));
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::config("start_rotation", "no tokio runtime").with_source(e))?;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let generation = {
            let mut state = self.state();
            if state.running.is_some() {
                return Err(Error::config("start_rotation", "rotation already running"));
            }
            state.generation += 1;
            state.running = Some(Running {
                generation: state.generation,
                interval,
                stop: Some(stop_tx),
            });
            state.generation
        };

        let target = Arc::clone(&self.target);
        let state = Arc::clone(&self.state);
        let cancel = cancel.clone();
        info!(?interval, "circuit rotation started");

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {
                        match target.new_identity().await {
                            Ok(()) => debug!("scheduled rotation done"),
                            Err(e) => warn!(error = %e, "scheduled rotation failed"),
                        }
                    }
                }
            }

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.running.as_ref().map(|r| r.generation) == Some(generation) {
                state.running = None;
            }
            info!("circuit rotation stopped");
        });

        Ok(())
    }

    /// Stop the rotation loop. No-op when idle.
    pub fn stop(&self) {
        let Some(mut running) = self.state().running.take() else {
            return;
        };
        if let Some(stop) = running.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Rotate once, now, regardless of scheduler state.
    pub async fn rotate_now(&self) -> Result<()> {
        self.target
            .new_identity()
            .await
            .map_err(|e| e.in_op("rotate_now"))
    }

    /// Request fresh circuits ahead of expected traffic.
    pub async fn prewarm(&self) -> Result<()> {
        debug!("prewarming circuits");
        self.target
            .new_identity()
            .await
            .map_err(|e| e.in_op("prewarm"))
    }
}
