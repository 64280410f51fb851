//! High-level recording interface over the raw Prometheus statics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library users
//! that never export metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    BATCHES_TOTAL, BATCH_DURATION, DISPATCH_ATTEMPTS_TOTAL, ROWS_UPSERTED_TOTAL,
};

/// Metrics collector for recording pipeline operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished batch dispatch.
    ///
    /// # Arguments
    ///
    /// * `status` - `"completed"` or `"failed"`
    /// * `attempts` - HTTP attempts the batch took
    /// * `elapsed` - Dispatch wall time including backoff
    pub fn record_batch(&self, status: &str, attempts: u32, elapsed: Duration) {
        if let Some(batches_total) = BATCHES_TOTAL.get() {
            batches_total.with_label_values(&[status]).inc();
        }

        if let Some(attempts_total) = DISPATCH_ATTEMPTS_TOTAL.get() {
            attempts_total.inc_by(u64::from(attempts));
        }

        if let Some(duration) = BATCH_DURATION.get() {
            duration.observe(elapsed.as_secs_f64());
        }

        tracing::trace!(
            status = status,
            attempts = attempts,
            duration_secs = elapsed.as_secs_f64(),
            "Recorded batch metric"
        );
    }

    /// Record rows committed by an upsert.
    pub fn record_rows_upserted(&self, rows: usize) {
        if let Some(rows_total) = ROWS_UPSERTED_TOTAL.get() {
            rows_total.inc_by(rows as u64);
        }
    }
}
