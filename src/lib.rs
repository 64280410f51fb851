//! sentiment-forge: batch sentiment enrichment for stored comments.
//!
//! Pages comments out of a PostgREST/Supabase table, scores them in batches
//! against a model endpoint, and upserts the results back by id.

pub mod cli;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod utils;

pub use error::{DispatchError, MalformedResult, ReconcileError, SourceError};
pub use pipeline::{PipelineConfig, PipelineError, PipelineOrchestrator, RunReport};
