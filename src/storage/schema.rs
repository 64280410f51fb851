//! Writable-column allow-list for the result table.
//!
//! Model results can carry arbitrary fields; only those listed here are ever
//! sent to storage. The key column is always included.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::model::ModelResult;

/// One row to upsert: column name to value, key column included.
pub type Row = Map<String, Value>;

/// Default result table.
pub const COMMENTS_TABLE: &str = "comments";

/// Key column shared by records and results.
pub const KEY_COLUMN: &str = "id";

/// Enrichment columns the comments table accepts.
pub const COMMENT_RESULT_COLUMNS: &[&str] = &[
    "sentiment",
    "sentiment_score",
    "emotion",
    "emotions",
    "emotion_scores",
    "topics",
    "clusters",
    "readability",
    "hashtag_count",
];

/// A table name, its key column and the columns results may write.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table: String,
    pub key_column: String,
    writable: BTreeSet<String>,
}

impl TableSchema {
    pub fn new<I, S>(table: impl Into<String>, key_column: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            writable: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// The `comments` table with the standard enrichment columns.
    pub fn comments() -> Self {
        Self::new(COMMENTS_TABLE, KEY_COLUMN, COMMENT_RESULT_COLUMNS.iter().copied())
    }

    /// Same columns, different table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn is_writable(&self, column: &str) -> bool {
        self.writable.contains(column)
    }

    pub fn writable_columns(&self) -> impl Iterator<Item = &str> {
        self.writable.iter().map(String::as_str)
    }

    /// Project a result onto the writable columns. Nulls are skipped;
    /// `None` when nothing besides the key would be written.
    pub fn project(&self, result: &ModelResult) -> Option<Row> {
        let mut row = Row::new();
        for (column, value) in &result.fields {
            if value.is_null() || !self.is_writable(column) {
                continue;
            }
            row.insert(column.clone(), value.clone());
        }
        if row.is_empty() {
            return None;
        }
        row.insert(
            self.key_column.clone(),
            Value::String(result.id.as_str().to_string()),
        );
        Some(row)
    }
}
