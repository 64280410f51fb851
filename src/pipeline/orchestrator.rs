//! Pipeline orchestrator for a scoring run.
//!
//! This module provides the `PipelineOrchestrator` that drives one run:
//! - Fetch every record from the source
//! - Plan fixed-size batches
//! - Dispatch batches to the model, strictly in order
//! - Reconcile results back into storage
//! - Fold model and process metrics into a run report
//!
//! All per-run state lives in a [`RunContext`] created fresh by each call to
//! [`PipelineOrchestrator::run`], so an orchestrator can be reused.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DispatchError, ReconcileError, SourceError};
use crate::metrics::{MemoryCounter, MetricsCollector, RunStats, StatsAggregator};
use crate::model::{HttpModelClient, ModelDispatcher, ModelResult, RetryError};
use crate::source::{PagedSource, PostgrestPages, RecordId, RecordSource};
use crate::storage::{PostgrestClient, PostgrestRowStore, ResultReconciler, TableSchema};
use crate::utils::WindowRateLimiter;

use super::config::{ConfigError, PipelineConfig, ReconcileFailurePolicy, RunSettings, UpsertMode};
use super::planner::{batch_count, plan};
use super::timing::{Phase, TimingLedger, TimingReport};

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A client could not be constructed.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Not a single record could be read.
    #[error("Fetch failed: {0}")]
    SourceUnavailable(#[source] SourceError),

    /// The model endpoint refused a batch with a non-retryable error.
    #[error("Batch {batch_index} rejected on attempt {attempt}: {source}")]
    DispatchRejected {
        batch_index: usize,
        attempt: u32,
        committed: usize,
        #[source]
        source: DispatchError,
    },

    /// Every attempt for a batch failed.
    #[error("Batch {batch_index} failed after {attempts} attempt(s): {source}")]
    DispatchRetryExhausted {
        batch_index: usize,
        attempts: u32,
        committed: usize,
        #[source]
        source: DispatchError,
    },

    /// An upsert failed under the abort policy.
    #[error("Upsert for batch {batch_index} failed: {source}")]
    ReconcileFailed {
        batch_index: usize,
        committed: usize,
        #[source]
        source: ReconcileError,
    },
}

impl PipelineError {
    fn from_dispatch(batch_index: usize, committed: usize, err: RetryError<DispatchError>) -> Self {
        match err {
            RetryError::Aborted { attempt, error } => PipelineError::DispatchRejected {
                batch_index,
                attempt,
                committed,
                source: error,
            },
            RetryError::Exhausted { attempts, last } => PipelineError::DispatchRetryExhausted {
                batch_index,
                attempts,
                committed,
                source: last,
            },
        }
    }

    /// Phase the run was in when it failed.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            PipelineError::Config(_) | PipelineError::InitializationFailed(_) => None,
            PipelineError::SourceUnavailable(_) => Some(Phase::Fetch),
            PipelineError::DispatchRejected { .. } | PipelineError::DispatchRetryExhausted { .. } => {
                Some(Phase::Dispatch)
            }
            PipelineError::ReconcileFailed { .. } => Some(Phase::Reconcile),
        }
    }

    /// Batch the run failed on, if it got that far.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            PipelineError::DispatchRejected { batch_index, .. }
            | PipelineError::DispatchRetryExhausted { batch_index, .. }
            | PipelineError::ReconcileFailed { batch_index, .. } => Some(*batch_index),
            _ => None,
        }
    }

    /// Rows already committed before the failure. They are not rolled back.
    pub fn committed_rows(&self) -> usize {
        match self {
            PipelineError::DispatchRejected { committed, .. }
            | PipelineError::DispatchRetryExhausted { committed, .. }
            | PipelineError::ReconcileFailed { committed, .. } => *committed,
            _ => 0,
        }
    }
}

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Planning,
    Dispatching(usize),
    Reconciling(usize),
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Fetching => write!(f, "fetching"),
            RunState::Planning => write!(f, "planning"),
            RunState::Dispatching(i) => write!(f, "dispatching({})", i),
            RunState::Reconciling(i) => write!(f, "reconciling({})", i),
            RunState::Done => write!(f, "done"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Mutable state of a single run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    state: RunState,
    pub stats: RunStats,
    pub timing: TimingLedger,
    /// Ids actually sent to the model; results for other ids are dropped.
    pub seen_ids: HashSet<RecordId>,
    pub number_of_comments: usize,
    pub number_of_batches: usize,
    pub batches_completed: usize,
    pub rows_updated: usize,
    pub source_partial: bool,
    pub reconcile_failures: usize,
    pub malformed_results: usize,
    pub unmatched_results: usize,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::Idle,
            stats: RunStats::new(),
            timing: TimingLedger::new(),
            seen_ids: HashSet::new(),
            number_of_comments: 0,
            number_of_batches: 0,
            batches_completed: 0,
            rows_updated: 0,
            source_partial: false,
            reconcile_failures: 0,
            malformed_results: 0,
            unmatched_results: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(run_id = %self.run_id, from = %self.state, to = %next, "Run state change");
        self.state = next;
    }
}

/// Terminal status of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    NoRecords,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::NoRecords => write!(f, "no_records"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub batch_size: usize,
    pub number_of_batches: usize,
    pub batches_completed: usize,
}

/// Summary of a run, serialized as the CLI's JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub number_of_comments: usize,
    pub number_updated: usize,
    pub timing: TimingReport,
    pub model_metrics: RunStats,
    pub batch_info: BatchInfo,
    pub source_partial: bool,
    pub reconcile_failures: usize,
    pub malformed_results: usize,
    pub unmatched_results: usize,
    pub finished_at: DateTime<Utc>,
}

/// Drives fetch, plan, dispatch and reconcile for one run at a time.
pub struct PipelineOrchestrator {
    settings: RunSettings,
    source: Arc<dyn RecordSource>,
    dispatcher: ModelDispatcher,
    reconciler: ResultReconciler,
    aggregator: StatsAggregator,
    memory: Option<MemoryCounter>,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    pub fn new(
        settings: RunSettings,
        source: Arc<dyn RecordSource>,
        dispatcher: ModelDispatcher,
        reconciler: ResultReconciler,
    ) -> Self {
        Self {
            settings,
            source,
            dispatcher,
            reconciler,
            aggregator: StatsAggregator::default(),
            memory: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Wire HTTP clients for the model endpoint and the PostgREST store.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if validation fails and
    /// `PipelineError::InitializationFailed` if an HTTP client cannot be built.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let postgrest = PostgrestClient::new(
            &config.storage_url,
            &config.storage_api_key,
            config.request_timeout,
        )
        .map_err(|e| PipelineError::InitializationFailed(e.to_string()))?;

        let limiter = config
            .rate_limit_per_minute
            .map(|limit| Arc::new(WindowRateLimiter::per_minute(limit)));

        let mut pages = PostgrestPages::new(postgrest.clone(), &config.table)
            .with_only_pending(config.only_pending);
        let mut model = HttpModelClient::new(&config.model_endpoint, config.request_timeout)
            .map_err(|e| PipelineError::InitializationFailed(e.to_string()))?
            .with_response_mode(config.response_mode);
        if let Some(limiter) = limiter {
            pages = pages.with_rate_limiter(limiter.clone());
            model = model.with_rate_limiter(limiter);
        }
        let source = PagedSource::new(pages, config.page_size).with_max_records(config.max_records);
        let dispatcher = ModelDispatcher::new(Arc::new(model), config.retry_policy());

        let reconciler = ResultReconciler::new(
            Arc::new(PostgrestRowStore::new(postgrest)),
            TableSchema::comments().with_table(&config.table),
        );

        tracing::info!(
            model_endpoint = %config.model_endpoint,
            table = %config.table,
            batch_size = config.batch_size,
            max_attempts = config.max_attempts,
            response_mode = %config.response_mode,
            upsert_mode = %config.upsert_mode,
            "Pipeline configured"
        );

        Ok(Self::new(
            config.run_settings(),
            Arc::new(source),
            dispatcher,
            reconciler,
        ))
    }

    /// Replace the reconciler, e.g. with an in-memory store for dry runs.
    pub fn with_reconciler(mut self, reconciler: ResultReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// Fold process memory figures from `counter` into each run's stats.
    pub fn with_memory_counter(mut self, counter: MemoryCounter) -> Self {
        self.memory = Some(counter);
        self
    }

    pub fn with_aggregator(mut self, aggregator: StatsAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Execute one full run.
    ///
    /// # Errors
    ///
    /// Returns a `PipelineError` if the source is unavailable, a batch cannot
    /// be dispatched, or an upsert fails under the abort policy. Rows
    /// committed before the failure stay committed.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let mut ctx = RunContext::new();
        if let Some(counter) = &self.memory {
            counter.reset();
        }

        tracing::info!(run_id = %ctx.run_id, batch_size = self.settings.batch_size, "Starting run");

        let started = Instant::now();
        let result = self.execute(&mut ctx).await;
        ctx.timing.record(Phase::Total, started.elapsed());

        match result {
            Ok(status) => {
                ctx.transition(RunState::Done);
                if let Some(counter) = &self.memory {
                    self.aggregator
                        .merge(&mut ctx.stats, &counter.snapshot().to_stats());
                }
                let report = self.build_report(ctx, status);
                tracing::info!(
                    run_id = %report.run_id,
                    status = %report.status,
                    comments = report.number_of_comments,
                    updated = report.number_updated,
                    batches = report.batch_info.batches_completed,
                    total_secs = report.timing.total,
                    "Run finished"
                );
                Ok(report)
            }
            Err(err) => {
                ctx.transition(RunState::Aborted);
                tracing::error!(
                    run_id = %ctx.run_id,
                    phase = ?err.phase(),
                    batch = ?err.batch_index(),
                    committed = err.committed_rows(),
                    error = %err,
                    "Run aborted"
                );
                Err(err)
            }
        }
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<RunStatus, PipelineError> {
        ctx.transition(RunState::Fetching);
        let fetched = ctx
            .timing
            .measure(Phase::Fetch, self.source.fetch_all())
            .await
            .map_err(PipelineError::SourceUnavailable)?;

        if let Some(truncated) = &fetched.truncated {
            tracing::warn!(error = %truncated, "Continuing with a truncated record set");
            ctx.source_partial = true;
        }

        let records = fetched.records;
        ctx.number_of_comments = records.len();
        if records.is_empty() {
            tracing::info!("No records to score");
            return Ok(RunStatus::NoRecords);
        }

        ctx.transition(RunState::Planning);
        ctx.seen_ids = records.iter().map(|r| r.id.clone()).collect();
        let batch_size = self.settings.batch_size.max(1);
        ctx.number_of_batches = batch_count(records.len(), batch_size);
        let batches = plan(records, batch_size);

        tracing::info!(
            records = ctx.number_of_comments,
            batches = ctx.number_of_batches,
            batch_size = batch_size,
            "Planned batches"
        );

        let mut pending: Vec<ModelResult> = Vec::new();

        for batch in &batches {
            ctx.transition(RunState::Dispatching(batch.index));
            let started = Instant::now();
            let dispatched = ctx
                .timing
                .measure(Phase::Dispatch, self.dispatcher.dispatch(batch))
                .await;

            let outcome = match dispatched {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.metrics
                        .record_batch("failed", err.attempts(), started.elapsed());
                    return Err(PipelineError::from_dispatch(
                        batch.index,
                        ctx.rows_updated,
                        err,
                    ));
                }
            };
            self.metrics
                .record_batch("completed", outcome.attempts, started.elapsed());

            self.aggregator.merge(&mut ctx.stats, &outcome.stats);
            ctx.malformed_results += outcome.malformed.len();
            ctx.batches_completed += 1;

            match self.settings.upsert_mode {
                UpsertMode::PerBatch => {
                    ctx.transition(RunState::Reconciling(batch.index));
                    self.reconcile(ctx, batch.index, &outcome.results).await?;
                }
                UpsertMode::EndOfRun => pending.extend(outcome.results),
            }
        }

        if self.settings.upsert_mode == UpsertMode::EndOfRun {
            for (index, chunk) in pending.chunks(batch_size).enumerate() {
                ctx.transition(RunState::Reconciling(index));
                self.reconcile(ctx, index, chunk).await?;
            }
        }

        Ok(RunStatus::Completed)
    }

    async fn reconcile(
        &self,
        ctx: &mut RunContext,
        batch_index: usize,
        results: &[ModelResult],
    ) -> Result<(), PipelineError> {
        let outcome = ctx
            .timing
            .measure(
                Phase::Reconcile,
                self.reconciler.reconcile(results, &ctx.seen_ids),
            )
            .await;

        ctx.rows_updated += outcome.written;
        ctx.unmatched_results += outcome.dropped_unmatched;
        self.metrics.record_rows_upserted(outcome.written);

        if let Some(first) = outcome.failures.first() {
            ctx.reconcile_failures += outcome.failures.len();
            match self.settings.reconcile_failure_policy {
                ReconcileFailurePolicy::Continue => {
                    tracing::warn!(
                        batch = batch_index,
                        failed_rows = outcome.failed_rows,
                        error = %first,
                        "Upsert failed, continuing"
                    );
                }
                ReconcileFailurePolicy::Abort => {
                    return Err(PipelineError::ReconcileFailed {
                        batch_index,
                        committed: ctx.rows_updated,
                        source: first.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn build_report(&self, ctx: RunContext, status: RunStatus) -> RunReport {
        let message = match status {
            RunStatus::NoRecords => Some("No comments found to analyze".to_string()),
            RunStatus::Completed if ctx.source_partial => {
                Some("Record source was truncated; scored the records that were read".to_string())
            }
            RunStatus::Completed => None,
        };

        RunReport {
            run_id: ctx.run_id,
            status,
            message,
            number_of_comments: ctx.number_of_comments,
            number_updated: ctx.rows_updated,
            timing: ctx.timing.report(),
            model_metrics: ctx.stats,
            batch_info: BatchInfo {
                batch_size: self.settings.batch_size,
                number_of_batches: ctx.number_of_batches,
                batches_completed: ctx.batches_completed,
            },
            source_partial: ctx.source_partial,
            reconcile_failures: ctx.reconcile_failures,
            malformed_results: ctx.malformed_results,
            unmatched_results: ctx.unmatched_results,
            finished_at: Utc::now(),
        }
    }
}
