//! Shared PostgREST (Supabase REST) client.
//!
//! Both the record source and the row store talk to the same REST endpoint with
//! the same credentials, so they share one [`PostgrestClient`].

use std::time::Duration;

use reqwest::{Client, RequestBuilder};

/// Base URL, API key and a pooled HTTP client for `{base}/rest/v1/*`.
#[derive(Clone)]
pub struct PostgrestClient {
    base_url: String,
    api_key: String,
    http_client: Client,
}

impl std::fmt::Debug for PostgrestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl PostgrestClient {
    /// Create a client with the given per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/rest/v1/{table}`
    pub fn table_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.base_url,
            urlencoding::encode(table)
        )
    }

    /// Start a GET request with auth headers applied.
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.authorized(self.http_client.get(url))
    }

    /// Start a POST request with auth headers applied.
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.authorized(self.http_client.post(url))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url_trims_trailing_slash() {
        let client =
            PostgrestClient::new("https://xyz.supabase.co/", "key", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.table_url("comments"),
            "https://xyz.supabase.co/rest/v1/comments"
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let client =
            PostgrestClient::new("http://localhost:54321", "secret-key", Duration::from_secs(5))
                .unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("localhost:54321"));
    }
}
