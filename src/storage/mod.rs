//! Result persistence.
//!
//! # Overview
//!
//! - **PostgrestClient**: shared REST client for the Supabase/PostgREST store
//! - **TableSchema**: which result fields may be written, and under which key
//! - **ResultReconciler**: matches results to sent ids and upserts them
//! - **PostgrestRowStore / InMemoryRowStore**: [`RowStore`] backends
//!
//! # Usage
//!
//! ```rust,ignore
//! use sentiment_forge::storage::{PostgrestClient, PostgrestRowStore, ResultReconciler, TableSchema};
//! use std::sync::Arc;
//!
//! let client = PostgrestClient::new("https://xyz.supabase.co", "service-key", timeout)?;
//! let reconciler = ResultReconciler::new(
//!     Arc::new(PostgrestRowStore::new(client)),
//!     TableSchema::comments(),
//! );
//! let outcome = reconciler.reconcile(&results, &seen_ids).await;
//! println!("{} rows written", outcome.written);
//! ```

pub mod memory;
pub mod postgrest;
pub mod reconciler;
pub mod schema;

pub use memory::InMemoryRowStore;
pub use postgrest::PostgrestClient;
pub use reconciler::{PostgrestRowStore, ReconcileOutcome, ResultReconciler, RowStore};
pub use schema::{Row, TableSchema, COMMENTS_TABLE, COMMENT_RESULT_COLUMNS, KEY_COLUMN};
