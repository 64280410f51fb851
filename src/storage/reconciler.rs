//! Writes model results back to storage.
//!
//! Results are matched against the ids that were actually sent, projected
//! onto the table's writable columns, and upserted in groups that share the
//! same column set. An upsert failure never raises: it is reported in the
//! [`ReconcileOutcome`] and the remaining groups are still attempted.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use super::postgrest::PostgrestClient;
use super::schema::{Row, TableSchema};
use crate::error::ReconcileError;
use crate::model::ModelResult;
use crate::source::RecordId;

/// Bulk upsert keyed on a single column.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert or update `rows`, returning how many were committed. Every row
    /// carries the same set of columns.
    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> Result<usize, ReconcileError>;
}

/// PostgREST bulk upsert (`Prefer: resolution=merge-duplicates`).
#[derive(Debug, Clone)]
pub struct PostgrestRowStore {
    client: PostgrestClient,
}

impl PostgrestRowStore {
    pub fn new(client: PostgrestClient) -> Self {
        Self { client }
    }

    /// URL for an upsert of `columns` keyed on `key_column`.
    pub fn upsert_url(&self, table: &str, key_column: &str, columns: &[&str]) -> String {
        format!(
            "{}?on_conflict={}&columns={}",
            self.client.table_url(table),
            urlencoding::encode(key_column),
            urlencoding::encode(&columns.join(","))
        )
    }
}

#[async_trait]
impl RowStore for PostgrestRowStore {
    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> Result<usize, ReconcileError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let columns: Vec<&str> = first.keys().map(String::as_str).collect();
        let url = self.upsert_url(table, key_column, &columns);
        let body = serde_json::to_vec(rows).map_err(|e| ReconcileError::Encode(e.to_string()))?;

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .body(body)
            .send()
            .await
            .map_err(|e| ReconcileError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(ReconcileError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(rows.len())
    }
}

/// What one reconcile call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Rows committed.
    pub written: usize,
    /// Results whose id was never sent; never written.
    pub dropped_unmatched: usize,
    /// Results with no writable field.
    pub skipped_empty: usize,
    /// Rows in groups whose upsert failed.
    pub failed_rows: usize,
    pub failures: Vec<ReconcileError>,
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Matches, projects and upserts results.
pub struct ResultReconciler {
    store: Arc<dyn RowStore>,
    schema: TableSchema,
}

impl ResultReconciler {
    pub fn new(store: Arc<dyn RowStore>, schema: TableSchema) -> Self {
        Self { store, schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Upsert the results whose ids are in `seen_ids`.
    pub async fn reconcile(
        &self,
        results: &[ModelResult],
        seen_ids: &HashSet<RecordId>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        // Later results for the same id overwrite earlier fields.
        let mut by_id: BTreeMap<&RecordId, Row> = BTreeMap::new();
        for result in results {
            if !seen_ids.contains(&result.id) {
                tracing::warn!(id = %result.id, "Dropping result for an id that was never sent");
                outcome.dropped_unmatched += 1;
                continue;
            }
            match self.schema.project(result) {
                Some(row) => by_id.entry(&result.id).or_default().extend(row),
                None => outcome.skipped_empty += 1,
            }
        }

        for rows in group_by_columns(by_id.into_values()) {
            match self
                .store
                .upsert(&self.schema.table, &self.schema.key_column, &rows)
                .await
            {
                Ok(written) => outcome.written += written,
                Err(err) => {
                    tracing::error!(
                        table = %self.schema.table,
                        rows = rows.len(),
                        error = %err,
                        "Upsert failed"
                    );
                    outcome.failed_rows += rows.len();
                    outcome.failures.push(err);
                }
            }
        }

        tracing::debug!(
            written = outcome.written,
            unmatched = outcome.dropped_unmatched,
            skipped = outcome.skipped_empty,
            failed = outcome.failed_rows,
            "Reconciled results"
        );

        outcome
    }
}

/// Bulk upserts need one column set per request.
fn group_by_columns(rows: impl IntoIterator<Item = Row>) -> Vec<Vec<Row>> {
    let mut groups: BTreeMap<Vec<String>, Vec<Row>> = BTreeMap::new();
    for row in rows {
        let mut columns: Vec<String> = row.keys().cloned().collect();
        columns.sort();
        groups.entry(columns).or_default().push(row);
    }
    groups.into_values().collect()
}
