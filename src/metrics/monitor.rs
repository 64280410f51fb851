//! Background memory sampler for the running process.
//!
//! Samples resident set size on a fixed interval and accumulates initial, peak
//! and memory-time (MB·s) figures into shared atomic counters. The sampler task
//! is the only writer; the orchestrator reads a snapshot at the end of a run
//! and folds it into the run stats.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::stats::{round_to, BatchStats};

/// Snapshot of the memory counters.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySnapshot {
    /// RSS of the first sample, in MB.
    pub initial_mb: Option<f64>,
    /// Highest RSS seen, in MB.
    pub peak_mb: Option<f64>,
    /// Integral of RSS over time, in MB·s.
    pub memory_time_mb_s: f64,
    /// Number of samples taken.
    pub samples: u64,
}

impl MemorySnapshot {
    /// Express the snapshot as `process_*` metrics. Empty if nothing was sampled.
    pub fn to_stats(&self) -> BatchStats {
        let mut stats = BatchStats::new();
        if self.samples == 0 {
            return stats;
        }
        if let Some(initial) = self.initial_mb {
            stats.insert("process_initial_memory_mb".to_string(), initial);
        }
        if let Some(peak) = self.peak_mb {
            stats.insert("process_peak_memory_mb".to_string(), peak);
        }
        stats.insert(
            "process_memory_time_mb_s".to_string(),
            round_to(self.memory_time_mb_s, 4),
        );
        stats
    }
}

/// Shared atomic memory counters, in kB and kB·ms.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounter {
    /// First sample in kB, 0 until the first sample lands.
    pub initial_kb: Arc<AtomicU64>,
    pub peak_kb: Arc<AtomicU64>,
    pub integral_kb_ms: Arc<AtomicU64>,
    pub samples: Arc<AtomicU64>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one RSS reading that was held for `held`.
    pub fn record_sample(&self, rss_kb: u64, held: Duration) {
        let _ = self
            .initial_kb
            .compare_exchange(0, rss_kb, Ordering::Relaxed, Ordering::Relaxed);
        self.peak_kb.fetch_max(rss_kb, Ordering::Relaxed);
        self.integral_kb_ms
            .fetch_add(rss_kb.saturating_mul(held.as_millis() as u64), Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter. Called at the start of each run.
    pub fn reset(&self) {
        self.initial_kb.store(0, Ordering::Relaxed);
        self.peak_kb.store(0, Ordering::Relaxed);
        self.integral_kb_ms.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let kb_to_mb = |kb: u64| kb as f64 / 1024.0;
        let samples = self.samples.load(Ordering::Relaxed);
        let initial = self.initial_kb.load(Ordering::Relaxed);
        let peak = self.peak_kb.load(Ordering::Relaxed);
        let integral = self.integral_kb_ms.load(Ordering::Relaxed);

        MemorySnapshot {
            initial_mb: (samples > 0).then(|| kb_to_mb(initial)),
            peak_mb: (samples > 0).then(|| kb_to_mb(peak)),
            memory_time_mb_s: kb_to_mb(integral) / 1000.0,
            samples,
        }
    }
}

/// Resident memory of the current process, read through `sysinfo`.
pub struct ProcessMemory {
    system: System,
    pid: Pid,
}

impl ProcessMemory {
    pub fn current() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from(std::process::id() as usize),
        }
    }

    /// Resident set size in kB. `None` if the process cannot be read.
    pub fn rss_kb(&mut self) -> Option<u64> {
        if !self.system.refresh_process(self.pid) {
            return None;
        }
        // sysinfo reports bytes
        self.system
            .process(self.pid)
            .map(|process| process.memory() / 1024)
    }
}

/// A background task that samples process memory into a [`MemoryCounter`].
pub struct ProcessMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessMonitor {
    /// Sample the current process RSS every `interval`.
    pub fn start(counter: MemoryCounter, interval: Duration) -> Self {
        let mut memory = ProcessMemory::current();
        Self::start_with(counter, interval, move || memory.rss_kb())
    }

    /// Sample with a custom reader (returns RSS in kB).
    pub fn start_with<F>(counter: MemoryCounter, interval: Duration, mut sampler: F) -> Self
    where
        F: FnMut() -> Option<u64> + Send + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick
            let mut last = Instant::now();

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let now = Instant::now();
                let held = now.duration_since(last);
                last = now;

                match sampler() {
                    Some(rss_kb) => counter.record_sample(rss_kb, held),
                    None => {
                        tracing::debug!("Process memory unavailable, stopping sampler");
                        break;
                    }
                }
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the sampler to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
