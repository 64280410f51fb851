//! Pipeline orchestration for batch sentiment scoring.
//!
//! # Architecture
//!
//! - **Config**: environment-driven settings for every component
//! - **Planner**: splits the record set into fixed-size batches
//! - **Timing**: per-phase wall-clock ledger
//! - **Orchestrator**: runs fetch, plan, dispatch and reconcile in order
//!
//! # Pipeline Flow
//!
//! 1. **Fetch**: page every `{id, body}` record out of storage
//! 2. **Plan**: partition records into batches of `batch_size`
//! 3. **Dispatch**: send each batch to the model endpoint, retrying transient
//!    failures with exponential backoff
//! 4. **Reconcile**: upsert the allow-listed result fields back by id
//! 5. **Report**: counts, per-phase timing and aggregated model metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use sentiment_forge::pipeline::{PipelineConfig, PipelineOrchestrator};
//!
//! let config = PipelineConfig::from_env()?;
//! let orchestrator = PipelineOrchestrator::from_config(&config)?;
//! let report = orchestrator.run().await?;
//!
//! println!("{} of {} comments updated", report.number_updated, report.number_of_comments);
//! ```

pub mod config;
pub mod orchestrator;
pub mod planner;
pub mod timing;

pub use config::{ConfigError, PipelineConfig, ReconcileFailurePolicy, RunSettings, UpsertMode};
pub use orchestrator::{
    BatchInfo, PipelineError, PipelineOrchestrator, RunContext, RunReport, RunState, RunStatus,
};
pub use planner::{batch_count, plan, Batch};
pub use timing::{Phase, TimingLedger, TimingReport};
