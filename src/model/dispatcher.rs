//! Batch dispatch to the sentiment model endpoint.
//!
//! [`ModelTransport`] performs exactly one HTTP attempt; [`ModelDispatcher`]
//! wraps it in the retry policy, normalizes results and folds per-batch
//! metrics.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use super::retry::{RetryError, RetryPolicy};
use super::stream::LineBuffer;
use super::types::{BatchPayload, ModelResponse, ModelResult, StreamLine};
use crate::error::{DispatchError, MalformedResult};
use crate::metrics::{BatchStats, StatsAggregator};
use crate::pipeline::Batch;
use crate::utils::WindowRateLimiter;

/// How the response body is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Pick by `Content-Type`: ndjson-like types stream, everything else is unary.
    /// A multi-line body that is not valid unary JSON is still read as a stream.
    #[default]
    Auto,
    Unary,
    Stream,
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMode::Auto => write!(f, "auto"),
            ResponseMode::Unary => write!(f, "unary"),
            ResponseMode::Stream => write!(f, "stream"),
        }
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ResponseMode::Auto),
            "unary" | "json" => Ok(ResponseMode::Unary),
            "stream" | "ndjson" => Ok(ResponseMode::Stream),
            other => Err(format!(
                "unknown response mode '{}', expected auto, unary or stream",
                other
            )),
        }
    }
}

/// Whether a `Content-Type` value denotes a newline-delimited stream.
pub fn is_stream_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ["ndjson", "jsonl", "json-seq", "x-json-stream"]
        .iter()
        .any(|marker| ct.contains(marker))
}

/// A decoded reply together with transfer sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportReply {
    pub response: ModelResponse,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

/// One attempt at sending a batch.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn send(&self, payload: &BatchPayload) -> Result<TransportReply, DispatchError>;
}

/// HTTP transport: POSTs the payload as JSON to a fixed endpoint.
pub struct HttpModelClient {
    endpoint: String,
    http_client: Client,
    mode: ResponseMode,
    rate_limiter: Option<Arc<WindowRateLimiter>>,
}

impl HttpModelClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
            mode: ResponseMode::Auto,
            rate_limiter: None,
        })
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<WindowRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ModelTransport for HttpModelClient {
    async fn send(&self, payload: &BatchPayload) -> Result<TransportReply, DispatchError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(1).await;
        }

        let body = serde_json::to_vec(payload).map_err(|e| DispatchError::Encode(e.to_string()))?;
        let bytes_sent = body.len();

        let response = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(DispatchError::from_status(status.as_u16(), message));
        }

        let streaming = match self.mode {
            ResponseMode::Stream => true,
            ResponseMode::Unary => false,
            ResponseMode::Auto => response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(is_stream_content_type),
        };

        if streaming {
            let (lines, bytes_received) = read_stream(response).await?;
            Ok(TransportReply {
                response: ModelResponse::Stream(lines),
                bytes_sent,
                bytes_received,
            })
        } else {
            let bytes = response.bytes().await?;
            let decoded = match ModelResponse::decode_unary(&bytes) {
                Ok(decoded) => decoded,
                // Some servers stream NDJSON under a generic or missing content type.
                Err(err) if self.mode == ResponseMode::Auto => match split_buffered_lines(&bytes) {
                    Some(lines) => {
                        tracing::debug!(
                            lines = lines.len(),
                            "Unary decode failed, reading body as a line stream"
                        );
                        ModelResponse::Stream(lines)
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            };
            Ok(TransportReply {
                response: decoded,
                bytes_sent,
                bytes_received: bytes.len(),
            })
        }
    }
}

/// Decode lines as chunks arrive; only the unterminated tail is buffered.
async fn read_stream(response: reqwest::Response) -> Result<(Vec<StreamLine>, usize), DispatchError> {
    let mut chunks = response.bytes_stream();
    let mut buffer = LineBuffer::new();
    let mut lines = Vec::new();
    let mut received = 0usize;
    let mut line_number = 0usize;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        received += chunk.len();
        for line in buffer.push(&chunk) {
            line_number += 1;
            lines.extend(StreamLine::decode(&line, line_number));
        }
    }
    if let Some(tail) = buffer.finish() {
        line_number += 1;
        lines.extend(StreamLine::decode(&tail, line_number));
    }

    Ok((lines, received))
}

/// Decode an already-buffered body line by line. `None` unless it holds more
/// than one non-blank line.
fn split_buffered_lines(body: &[u8]) -> Option<Vec<StreamLine>> {
    let mut buffer = LineBuffer::new();
    let mut raw = buffer.push(body);
    raw.extend(buffer.finish());

    if raw.iter().filter(|line| !line.trim().is_empty()).count() < 2 {
        return None;
    }
    Some(
        raw.iter()
            .enumerate()
            .filter_map(|(i, line)| StreamLine::decode(line, i + 1))
            .collect(),
    )
}

/// Results and stats for one successfully dispatched batch.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub batch_index: usize,
    pub results: Vec<ModelResult>,
    pub stats: BatchStats,
    pub attempts: u32,
    pub malformed: Vec<MalformedResult>,
    /// Stream lines with an unrecognised tag.
    pub ignored_lines: usize,
}

impl DispatchOutcome {
    fn push_result(&mut self, mut result: ModelResult) {
        for problem in result.normalize() {
            tracing::warn!(batch = self.batch_index, error = %problem, "Left result field unparsed");
            self.malformed.push(problem);
        }
        self.results.push(result);
    }

    fn push_malformed(&mut self, problem: MalformedResult) {
        tracing::warn!(batch = self.batch_index, error = %problem, "Skipping malformed result");
        self.malformed.push(problem);
    }
}

/// Sends batches through a transport under a retry policy.
pub struct ModelDispatcher {
    transport: Arc<dyn ModelTransport>,
    retry: RetryPolicy,
    aggregator: StatsAggregator,
}

impl ModelDispatcher {
    pub fn new(transport: Arc<dyn ModelTransport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            aggregator: StatsAggregator::default(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: StatsAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Dispatch one batch. Retryable failures are retried with backoff; a
    /// non-retryable failure or an exhausted budget is returned as-is.
    pub async fn dispatch(&self, batch: &Batch) -> Result<DispatchOutcome, RetryError<DispatchError>> {
        let payload = BatchPayload::from_batch(batch);
        let payload = &payload;
        let transport = &self.transport;

        let retried = self
            .retry
            .run(move |attempt| async move {
                tracing::debug!(
                    batch = batch.index,
                    attempt = attempt,
                    records = payload.len(),
                    "Sending batch to model endpoint"
                );
                transport.send(payload).await
            })
            .await?;

        let reply = retried.value;
        let mut outcome = DispatchOutcome {
            batch_index: batch.index,
            attempts: retried.attempts,
            ..Default::default()
        };

        match reply.response {
            ModelResponse::Unary {
                results,
                metrics,
                rejected,
            } => {
                for result in results {
                    outcome.push_result(result);
                }
                for problem in rejected {
                    outcome.push_malformed(problem);
                }
                self.aggregator.merge(&mut outcome.stats, &metrics);
            }
            ModelResponse::Stream(lines) => {
                for line in lines {
                    match line {
                        StreamLine::Result(result) => outcome.push_result(result),
                        StreamLine::Stats(metrics) => {
                            self.aggregator.merge(&mut outcome.stats, &metrics)
                        }
                        StreamLine::Unknown { tag } => {
                            tracing::debug!(batch = batch.index, tag = %tag, "Discarding stream line with unknown type");
                            outcome.ignored_lines += 1;
                        }
                        StreamLine::Malformed(problem) => outcome.push_malformed(problem),
                    }
                }
            }
        }

        let transfer = BatchStats::from([
            ("request_bytes".to_string(), reply.bytes_sent as f64),
            ("response_bytes".to_string(), reply.bytes_received as f64),
            ("attempts".to_string(), f64::from(retried.attempts)),
        ]);
        self.aggregator.merge(&mut outcome.stats, &transfer);

        tracing::info!(
            batch = batch.index,
            records = batch.len(),
            results = outcome.results.len(),
            malformed = outcome.malformed.len(),
            attempts = outcome.attempts,
            "Batch scored"
        );

        Ok(outcome)
    }
}
