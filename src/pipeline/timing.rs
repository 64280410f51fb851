//! Per-phase wall-clock accounting.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Pipeline phases that are timed and that errors are attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Dispatch,
    Reconcile,
    Total,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Fetch => write!(f, "fetch"),
            Phase::Dispatch => write!(f, "dispatch"),
            Phase::Reconcile => write!(f, "reconcile"),
            Phase::Total => write!(f, "total"),
        }
    }
}

/// Accumulated time per phase. Dispatch time includes retry backoff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingLedger {
    entries: BTreeMap<Phase, Duration>,
}

impl TimingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `elapsed` to `phase`.
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        *self.entries.entry(phase).or_default() += elapsed;
    }

    pub fn get(&self, phase: Phase) -> Duration {
        self.entries.get(&phase).copied().unwrap_or_default()
    }

    /// Await `fut`, charging its wall time to `phase`.
    pub async fn measure<F: Future>(&mut self, phase: Phase, fut: F) -> F::Output {
        let start = Instant::now();
        let output = fut.await;
        self.record(phase, start.elapsed());
        output
    }

    pub fn report(&self) -> TimingReport {
        TimingReport {
            fetch: self.get(Phase::Fetch).as_secs_f64(),
            dispatch: self.get(Phase::Dispatch).as_secs_f64(),
            reconcile: self.get(Phase::Reconcile).as_secs_f64(),
            total: self.get(Phase::Total).as_secs_f64(),
        }
    }
}

/// Phase durations in seconds, as they appear in the run report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingReport {
    pub fetch: f64,
    pub dispatch: f64,
    pub reconcile: f64,
    pub total: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut ledger = TimingLedger::new();
        ledger.record(Phase::Dispatch, Duration::from_millis(300));
        ledger.record(Phase::Dispatch, Duration::from_millis(200));

        assert_eq!(ledger.get(Phase::Dispatch), Duration::from_millis(500));
        assert_eq!(ledger.get(Phase::Fetch), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_charges_phase() {
        let mut ledger = TimingLedger::new();
        let value = ledger
            .measure(Phase::Reconcile, async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                7
            })
            .await;

        assert_eq!(value, 7);
        assert_eq!(ledger.get(Phase::Reconcile), Duration::from_secs(2));
    }

    #[test]
    fn test_report_serializes_all_phases() {
        let mut ledger = TimingLedger::new();
        ledger.record(Phase::Fetch, Duration::from_millis(1500));
        let json = serde_json::to_value(ledger.report()).unwrap();

        assert_eq!(json["fetch"], 1.5);
        assert_eq!(json["dispatch"], 0.0);
        assert_eq!(json["total"], 0.0);
        assert_eq!(Phase::Reconcile.to_string(), "reconcile");
    }
}
