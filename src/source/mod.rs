//! Record retrieval from the backing store.
//!
//! This module provides the record types that flow through the pipeline and
//! the [`RecordSource`] seam the orchestrator reads from.
//!
//! # Overview
//!
//! - **Record / RecordId**: the `{id, body}` rows to be scored
//! - **PagedSource**: generic offset/limit pagination with id deduplication
//! - **PostgrestPages**: page fetcher for a PostgREST (Supabase) table
//!
//! # Usage
//!
//! ```rust,ignore
//! use sentiment_forge::source::{PagedSource, PostgrestPages, RecordSource};
//! use sentiment_forge::storage::PostgrestClient;
//!
//! let client = PostgrestClient::new("https://xyz.supabase.co", "service-key", timeout)?;
//! let source = PagedSource::new(PostgrestPages::new(client, "comments"), 1000);
//! let outcome = source.fetch_all().await?;
//! println!("{} records in {} page(s)", outcome.records.len(), outcome.pages_fetched);
//! ```

pub mod paged;
pub mod postgrest;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SourceError;

pub use paged::{PageFetcher, PagedSource};
pub use postgrest::PostgrestPages;

/// Opaque record identifier. Accepts JSON strings and integers; always
/// carried (and written back) as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret a JSON value as an id. Only strings and integers qualify.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        RecordId::from_json(&value).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "record id must be a non-empty string or an integer, got {}",
                value
            ))
        })
    }
}

/// A text record to be scored. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub body: String,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Result of a full fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Deduplicated records in store order.
    pub records: Vec<Record>,
    /// Pages successfully read, including a terminal empty page.
    pub pages_fetched: usize,
    /// Set when pagination stopped early because a later page failed.
    pub truncated: Option<SourceError>,
}

impl FetchOutcome {
    pub fn is_partial(&self) -> bool {
        self.truncated.is_some()
    }
}

/// Anything that can produce the full record set for one run.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Read every record. Fails only if nothing could be read at all.
    async fn fetch_all(&self) -> Result<FetchOutcome, SourceError>;
}
