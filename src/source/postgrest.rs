//! Page fetcher for a PostgREST table of `{id, body}` rows.

use std::sync::Arc;

use async_trait::async_trait;

use super::{PageFetcher, Record};
use crate::error::SourceError;
use crate::storage::PostgrestClient;
use crate::utils::WindowRateLimiter;

/// Reads `id, body` from a table, ordered by id for stable offsets.
#[derive(Debug, Clone)]
pub struct PostgrestPages {
    client: PostgrestClient,
    table: String,
    only_pending: bool,
    rate_limiter: Option<Arc<WindowRateLimiter>>,
}

impl PostgrestPages {
    pub fn new(client: PostgrestClient, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            only_pending: false,
            rate_limiter: None,
        }
    }

    /// Only read rows whose `sentiment` column is still null.
    pub fn with_only_pending(mut self, only_pending: bool) -> Self {
        self.only_pending = only_pending;
        self
    }

    /// Share a call budget with other clients hitting the same project.
    pub fn with_rate_limiter(mut self, limiter: Arc<WindowRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// URL for one page.
    pub fn page_url(&self, offset: usize, limit: usize) -> String {
        let mut url = format!(
            "{}?select=id,body&order=id.asc&limit={}&offset={}",
            self.client.table_url(&self.table),
            limit,
            offset
        );
        if self.only_pending {
            url.push_str("&sentiment=is.null");
        }
        url
    }
}

#[async_trait]
impl PageFetcher for PostgrestPages {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>, SourceError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(1).await;
        }
        let url = self.page_url(offset, limit);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(SourceError::Request(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        serde_json::from_slice(&bytes).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pages() -> PostgrestPages {
        let client =
            PostgrestClient::new("http://localhost:54321", "key", Duration::from_secs(5)).unwrap();
        PostgrestPages::new(client, "comments")
    }

    #[test]
    fn test_page_url() {
        assert_eq!(
            pages().page_url(2000, 1000),
            "http://localhost:54321/rest/v1/comments?select=id,body&order=id.asc&limit=1000&offset=2000"
        );
    }

    #[test]
    fn test_page_url_only_pending() {
        let url = pages().with_only_pending(true).page_url(0, 10);
        assert!(url.ends_with("&sentiment=is.null"));
    }
}
