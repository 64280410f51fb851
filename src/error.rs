//! Error types for sentiment-forge operations.
//!
//! Defines error types for the pipeline subsystems:
//! - Record source pagination
//! - Model endpoint dispatch (one value per failed attempt)
//! - Result reconciliation (bulk upserts)
//! - Per-result normalization problems
//!
//! Fatal, run-level errors live next to the orchestrator
//! (`crate::pipeline::PipelineError`) because they carry batch context.

use thiserror::Error;

use crate::model::retry::Retryable;

/// Errors that can occur while paging records out of storage.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// A single page request failed (connection error or non-success status).
    #[error("Page request failed: {0}")]
    Request(String),

    /// A page was returned but could not be decoded.
    #[error("Failed to decode page: {0}")]
    Decode(String),

    /// The very first page could not be fetched; nothing was read.
    #[error("Record source unavailable: {0}")]
    Unavailable(String),

    /// Pagination stopped early; the records read so far are still returned.
    #[error("Record source truncated after {pages_fetched} page(s) and {records_fetched} record(s): {cause}")]
    Partial {
        pages_fetched: usize,
        records_fetched: usize,
        cause: String,
    },
}

/// Errors produced by a single attempt to send a batch to the model endpoint.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("Connection to model endpoint failed: {0}")]
    Connection(String),

    #[error("Model request timed out: {0}")]
    Timeout(String),

    #[error("Model endpoint server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// HTTP 429. A client error like any other 4xx, so never retried.
    #[error("Model endpoint rate limited the request: {0}")]
    RateLimited(String),

    #[error("Model endpoint rejected the batch ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    /// The batch payload could not be serialized. Never retried.
    #[error("Failed to encode batch payload: {0}")]
    Encode(String),
}

impl DispatchError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => DispatchError::RateLimited(message),
            500..=599 => DispatchError::Server { status, message },
            _ => DispatchError::Rejected { status, message },
        }
    }

    /// HTTP status code attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchError::Server { status, .. } | DispatchError::Rejected { status, .. } => {
                Some(*status)
            }
            DispatchError::RateLimited(_) => Some(429),
            _ => None,
        }
    }
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DispatchError::Rejected { .. }
                | DispatchError::RateLimited(_)
                | DispatchError::Encode(_)
        )
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            DispatchError::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            DispatchError::InvalidResponse(err.to_string())
        } else {
            DispatchError::Connection(err.to_string())
        }
    }
}

/// Errors returned by a bulk upsert. Non-fatal unless the run is configured
/// to abort on reconcile failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReconcileError {
    #[error("Upsert request failed: {0}")]
    RequestFailed(String),

    #[error("Upsert rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to encode rows: {0}")]
    Encode(String),
}

/// A single result entry (or stream line) that could not be normalized.
/// Logged and counted; never fails the batch.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Malformed result ({context}): {reason}")]
pub struct MalformedResult {
    /// Where the problem was found, e.g. `id=abc field=topics` or `stream line 4`.
    pub context: String,
    pub reason: String,
}

impl MalformedResult {
    pub fn new(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            reason: reason.into(),
        }
    }
}
