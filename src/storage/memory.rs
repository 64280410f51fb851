//! In-process row store, used for dry runs and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::reconciler::RowStore;
use super::schema::Row;
use crate::error::ReconcileError;

/// Keeps upserted rows in memory, merging columns on key conflicts.
#[derive(Debug, Default)]
pub struct InMemoryRowStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    failing_tables: HashSet<String>,
    upsert_calls: AtomicUsize,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every upsert into `table`.
    pub fn failing_table(mut self, table: impl Into<String>) -> Self {
        self.failing_tables.insert(table.into());
        self
    }

    /// Row stored under `key`, if any.
    pub fn get(&self, table: &str, key: &str) -> Option<Row> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    /// Number of distinct rows in `table`.
    pub fn len(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Upsert calls received, including rejected ones.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::Relaxed)
    }
}

fn key_of(row: &Row, key_column: &str) -> Option<String> {
    match row.get(key_column)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> Result<usize, ReconcileError> {
        self.upsert_calls.fetch_add(1, Ordering::Relaxed);

        if self.failing_tables.contains(table) {
            return Err(ReconcileError::Rejected {
                status: 503,
                message: format!("table '{}' is unavailable", table),
            });
        }

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = key_of(row, key_column).ok_or_else(|| {
                ReconcileError::Encode(format!("row is missing key column '{}'", key_column))
            })?;
            keyed.push((key, row));
        }

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let stored = tables.entry(table.to_string()).or_default();
        for (key, row) in keyed {
            let existing = stored.entry(key).or_default();
            for (column, value) in row {
                existing.insert(column.clone(), value.clone());
            }
        }

        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_merges_columns() {
        let store = InMemoryRowStore::new();
        store
            .upsert(
                "comments",
                "id",
                &[row(&[("id", json!("a")), ("sentiment", json!("positive"))])],
            )
            .await
            .unwrap();
        store
            .upsert(
                "comments",
                "id",
                &[row(&[("id", json!("a")), ("emotion", json!("joy"))])],
            )
            .await
            .unwrap();

        let stored = store.get("comments", "a").unwrap();
        assert_eq!(stored["sentiment"], json!("positive"));
        assert_eq!(stored["emotion"], json!("joy"));
        assert_eq!(store.len("comments"), 1);
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_key_rejected_atomically() {
        let store = InMemoryRowStore::new();
        let result = store
            .upsert(
                "comments",
                "id",
                &[
                    row(&[("id", json!("a")), ("sentiment", json!("x"))]),
                    row(&[("sentiment", json!("y"))]),
                ],
            )
            .await;

        assert!(matches!(result, Err(ReconcileError::Encode(_))));
        assert!(store.is_empty("comments"));
    }

    #[tokio::test]
    async fn test_failing_table() {
        let store = InMemoryRowStore::new().failing_table("comments");
        let result = store
            .upsert("comments", "id", &[row(&[("id", json!("a"))])])
            .await;
        assert!(matches!(result, Err(ReconcileError::Rejected { status: 503, .. })));
    }
}
