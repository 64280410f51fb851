//! Offset/limit pagination over any page fetcher.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{FetchOutcome, Record, RecordSource};
use crate::error::SourceError;

/// Fetches one fixed-size page of records starting at `offset`.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>, SourceError>;
}

/// Reads pages until a short page, deduplicating by id.
///
/// A failure on the first page makes the whole source unavailable. A failure
/// on any later page stops pagination and the records read so far are
/// returned with [`FetchOutcome::truncated`] set.
pub struct PagedSource<F> {
    fetcher: F,
    page_size: usize,
    max_records: Option<usize>,
}

impl<F: PageFetcher> PagedSource<F> {
    pub fn new(fetcher: F, page_size: usize) -> Self {
        Self {
            fetcher,
            page_size: page_size.max(1),
            max_records: None,
        }
    }

    /// Stop once this many distinct records have been read.
    pub fn with_max_records(mut self, max_records: Option<usize>) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn cap_reached(&self, count: usize) -> bool {
        self.max_records.is_some_and(|cap| count >= cap)
    }
}

#[async_trait]
impl<F: PageFetcher> RecordSource for PagedSource<F> {
    async fn fetch_all(&self) -> Result<FetchOutcome, SourceError> {
        let mut records: Vec<Record> = Vec::new();
        let mut seen = HashSet::new();
        let mut pages_fetched = 0usize;
        let mut offset = 0usize;
        let mut duplicates = 0usize;

        while !self.cap_reached(records.len()) {
            let page = match self.fetcher.fetch_page(offset, self.page_size).await {
                Ok(page) => page,
                Err(err) if pages_fetched == 0 => {
                    tracing::error!(error = %err, "First record page failed");
                    return Err(SourceError::Unavailable(err.to_string()));
                }
                Err(err) => {
                    tracing::warn!(
                        pages_fetched = pages_fetched,
                        records = records.len(),
                        error = %err,
                        "Record page failed, keeping records read so far"
                    );
                    let truncated = SourceError::Partial {
                        pages_fetched,
                        records_fetched: records.len(),
                        cause: err.to_string(),
                    };
                    return Ok(FetchOutcome {
                        records,
                        pages_fetched,
                        truncated: Some(truncated),
                    });
                }
            };

            pages_fetched += 1;
            let returned = page.len();
            for record in page {
                if seen.insert(record.id.clone()) {
                    records.push(record);
                } else {
                    duplicates += 1;
                }
            }

            tracing::debug!(
                page = pages_fetched,
                offset = offset,
                returned = returned,
                total = records.len(),
                "Fetched record page"
            );

            if returned < self.page_size {
                break;
            }
            offset += returned;
        }

        if let Some(cap) = self.max_records {
            records.truncate(cap);
        }

        if duplicates > 0 {
            tracing::warn!(duplicates = duplicates, "Dropped duplicate record ids across pages");
        }

        tracing::info!(
            records = records.len(),
            pages = pages_fetched,
            "Record fetch complete"
        );

        Ok(FetchOutcome {
            records,
            pages_fetched,
            truncated: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves `total` sequential records; optionally fails at a given page.
    struct ScriptedPages {
        total: usize,
        fail_on_page: Option<usize>,
        duplicate_boundary: bool,
        calls: Mutex<Vec<(usize, usize)>>,
    }

    impl ScriptedPages {
        fn new(total: usize) -> Self {
            Self {
                total,
                fail_on_page: None,
                duplicate_boundary: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, page: usize) -> Self {
            self.fail_on_page = Some(page);
            self
        }

        fn calls(&self) -> Vec<(usize, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedPages {
        async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>, SourceError> {
            let page_number = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((offset, limit));
                calls.len()
            };
            if self.fail_on_page == Some(page_number) {
                return Err(SourceError::Request("HTTP 500: boom".to_string()));
            }
            // Shift windows back by one so each page repeats the previous tail.
            let start = if self.duplicate_boundary && offset > 0 {
                offset - 1
            } else {
                offset
            };
            let end = (start + limit).min(self.total);
            Ok((start..end)
                .map(|i| Record::new(format!("c{:04}", i), format!("comment {}", i)))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_reads_until_short_page() {
        let source = PagedSource::new(ScriptedPages::new(25), 10);
        let outcome = source.fetch_all().await.unwrap();

        assert_eq!(outcome.records.len(), 25);
        assert_eq!(outcome.pages_fetched, 3);
        assert!(!outcome.is_partial());
        assert_eq!(source.fetcher.calls(), vec![(0, 10), (10, 10), (20, 10)]);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_page() {
        let source = PagedSource::new(ScriptedPages::new(20), 10);
        let outcome = source.fetch_all().await.unwrap();

        assert_eq!(outcome.records.len(), 20);
        assert_eq!(outcome.pages_fetched, 3);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let source = PagedSource::new(ScriptedPages::new(0), 10);
        let outcome = source.fetch_all().await.unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.pages_fetched, 1);
    }

    #[tokio::test]
    async fn test_first_page_failure_is_unavailable() {
        let source = PagedSource::new(ScriptedPages::new(25).failing_on(1), 10);
        let err = source.fetch_all().await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_later_page_failure_returns_partial() {
        let source = PagedSource::new(ScriptedPages::new(50).failing_on(3), 10);
        let outcome = source.fetch_all().await.unwrap();

        assert_eq!(outcome.records.len(), 20);
        assert_eq!(outcome.pages_fetched, 2);
        match outcome.truncated {
            Some(SourceError::Partial {
                pages_fetched,
                records_fetched,
                ..
            }) => {
                assert_eq!(pages_fetched, 2);
                assert_eq!(records_fetched, 20);
            }
            other => panic!("expected partial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicates_across_pages_are_dropped() {
        let mut pages = ScriptedPages::new(25);
        pages.duplicate_boundary = true;
        let source = PagedSource::new(pages, 10);
        let outcome = source.fetch_all().await.unwrap();

        let mut ids: Vec<_> = outcome.records.iter().map(|r| r.id.clone()).collect();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
        assert_eq!(outcome.records.len(), 25);
    }

    #[tokio::test]
    async fn test_max_records_cap() {
        let source = PagedSource::new(ScriptedPages::new(100), 10).with_max_records(Some(15));
        let outcome = source.fetch_all().await.unwrap();

        assert_eq!(outcome.records.len(), 15);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(outcome.records[14].id.as_str(), "c0014");
    }

    #[test]
    fn test_zero_page_size_clamped() {
        let source = PagedSource::new(ScriptedPages::new(1), 0);
        assert_eq!(source.page_size(), 1);
    }
}
