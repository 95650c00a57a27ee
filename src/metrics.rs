//! Optional per-operation metrics.

use std::time::Duration;

/// Receives one sample per completed client operation.
pub trait MetricsSink: Send + Sync + 'static {
    /// Record the outcome of `op`.
    fn record(&self, op: &'static str, latency: Duration, success: bool);
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _op: &'static str, _latency: Duration, _success: bool) {}
}
