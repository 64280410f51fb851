//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by sentiment-forge and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all sentiment-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total batches processed, labeled by status (`completed`, `failed`).
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total HTTP attempts made against the model endpoint.
pub static DISPATCH_ATTEMPTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Total rows committed by upserts.
pub static ROWS_UPSERTED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Wall time of one batch dispatch (including retries), in seconds.
pub static BATCH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let batches_total = CounterVec::new(
        Opts::new("sentiment_forge_batches_total", "Total batches processed"),
        &["status"],
    )?;

    let dispatch_attempts_total = IntCounter::new(
        "sentiment_forge_dispatch_attempts_total",
        "Total HTTP attempts against the model endpoint",
    )?;

    let rows_upserted_total = IntCounter::new(
        "sentiment_forge_rows_upserted_total",
        "Total rows committed to storage",
    )?;

    let batch_duration = Histogram::with_opts(
        HistogramOpts::new(
            "sentiment_forge_batch_duration_seconds",
            "Batch dispatch duration in seconds, retries included",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )?;

    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(dispatch_attempts_total.clone()))?;
    registry.register(Box::new(rows_upserted_total.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = DISPATCH_ATTEMPTS_TOTAL.set(dispatch_attempts_total);
    let _ = ROWS_UPSERTED_TOTAL.set(rows_upserted_total);
    let _ = BATCH_DURATION.set(batch_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
