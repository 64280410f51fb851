//! Per-key aggregation of model-reported metrics.
//!
//! Every batch reports a flat map of numeric metrics (memory readings, payload
//! sizes, ...). A [`MetricSchema`] says how each key folds into the running
//! run-level value: minimum, maximum or (optionally rounded) sum. Keys the
//! schema does not know are seeded on first sight and summed afterwards.
//!
//! All rules are commutative and associative, so batch completion order never
//! changes the aggregate.

use std::collections::BTreeMap;

/// Metrics reported for a single batch.
pub type BatchStats = BTreeMap<String, f64>;

/// Metrics folded across every batch of a run.
pub type RunStats = BTreeMap<String, f64>;

/// How a metric key combines across batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricRule {
    Min,
    Max,
    /// Sum, optionally rounded to `precision` decimal places after each merge.
    Sum { precision: Option<u32> },
}

impl MetricRule {
    /// Unrounded sum, applied to keys without a rule.
    pub const SUM: MetricRule = MetricRule::Sum { precision: None };

    pub fn rounded_sum(precision: u32) -> Self {
        MetricRule::Sum {
            precision: Some(precision),
        }
    }

    /// Value to store when a key is seen for the first time.
    pub fn seed(self, value: f64) -> f64 {
        match self {
            MetricRule::Sum {
                precision: Some(p),
            } => round_to(value, p),
            _ => value,
        }
    }

    pub fn combine(self, current: f64, incoming: f64) -> f64 {
        match self {
            MetricRule::Min => current.min(incoming),
            MetricRule::Max => current.max(incoming),
            MetricRule::Sum { precision } => {
                let sum = current + incoming;
                match precision {
                    Some(p) => round_to(sum, p),
                    None => sum,
                }
            }
        }
    }
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Declarative table of aggregation rules, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSchema {
    rules: BTreeMap<String, MetricRule>,
}

impl MetricSchema {
    /// An empty schema: every key is summed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the metrics the sentiment endpoint and this process report.
    pub fn standard() -> Self {
        Self::new()
            .with_rule("initial_memory_mb", MetricRule::Min)
            .with_rule("peak_memory_mb", MetricRule::Max)
            .with_rule("data_size_mb", MetricRule::rounded_sum(4))
            .with_rule("return_size_mb", MetricRule::rounded_sum(4))
            .with_rule("memory_time_mb_s", MetricRule::rounded_sum(4))
            .with_rule("process_initial_memory_mb", MetricRule::Min)
            .with_rule("process_peak_memory_mb", MetricRule::Max)
            .with_rule("process_memory_time_mb_s", MetricRule::rounded_sum(4))
            .with_rule("request_bytes", MetricRule::SUM)
            .with_rule("response_bytes", MetricRule::SUM)
            .with_rule("attempts", MetricRule::SUM)
    }

    pub fn with_rule(mut self, name: impl Into<String>, rule: MetricRule) -> Self {
        self.rules.insert(name.into(), rule);
        self
    }

    pub fn rule(&self, name: &str) -> Option<MetricRule> {
        self.rules.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Folds batch stats into run stats according to a [`MetricSchema`].
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    schema: MetricSchema,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(MetricSchema::standard())
    }
}

impl StatsAggregator {
    pub fn new(schema: MetricSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &MetricSchema {
        &self.schema
    }

    /// Merge `incoming` into `running` in place. Non-finite values are ignored.
    pub fn merge(&self, running: &mut RunStats, incoming: &BatchStats) {
        for (name, &value) in incoming {
            if !value.is_finite() {
                tracing::debug!(metric = %name, "Ignoring non-finite metric value");
                continue;
            }
            let rule = self.schema.rule(name).unwrap_or(MetricRule::SUM);
            match running.get_mut(name) {
                Some(current) => *current = rule.combine(*current, value),
                None => {
                    running.insert(name.clone(), rule.seed(value));
                }
            }
        }
    }

    /// Merging variant that takes and returns the running value.
    pub fn merged(&self, mut running: RunStats, incoming: &BatchStats) -> RunStats {
        self.merge(&mut running, incoming);
        running
    }
}
