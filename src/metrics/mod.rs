//! Metrics: model-reported stats aggregation, process memory sampling and
//! Prometheus export.
//!
//! # Example
//!
//! ```ignore
//! use sentiment_forge::metrics::{StatsAggregator, RunStats, BatchStats};
//!
//! let aggregator = StatsAggregator::default();
//! let mut run = RunStats::new();
//! aggregator.merge(&mut run, &BatchStats::from([("peak_memory_mb".to_string(), 412.0)]));
//! ```

pub mod collectors;
pub mod monitor;
pub mod prometheus;
pub mod stats;

pub use collectors::MetricsCollector;
pub use monitor::{MemoryCounter, MemorySnapshot, ProcessMemory, ProcessMonitor};
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
pub use stats::{BatchStats, MetricRule, MetricSchema, RunStats, StatsAggregator};
