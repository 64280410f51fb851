//! Pipeline configuration.
//!
//! This module provides configuration for a scoring run: endpoints and
//! credentials, paging and batching, retry behaviour, and how results are
//! written back.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::model::{ResponseMode, RetryPolicy};
use crate::storage::COMMENTS_TABLE;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// When results are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertMode {
    /// After each batch is scored.
    #[default]
    PerBatch,
    /// Once, after every batch has been scored, in chunks of the batch size.
    EndOfRun,
}

impl fmt::Display for UpsertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertMode::PerBatch => write!(f, "per_batch"),
            UpsertMode::EndOfRun => write!(f, "end_of_run"),
        }
    }
}

impl FromStr for UpsertMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "per_batch" | "batch" => Ok(UpsertMode::PerBatch),
            "end_of_run" | "end" => Ok(UpsertMode::EndOfRun),
            other => Err(format!(
                "unknown upsert mode '{}', expected per_batch or end_of_run",
                other
            )),
        }
    }
}

/// What a failed upsert does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileFailurePolicy {
    /// Log, count, keep going.
    #[default]
    Continue,
    /// Stop the run with an error.
    Abort,
}

impl fmt::Display for ReconcileFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileFailurePolicy::Continue => write!(f, "continue"),
            ReconcileFailurePolicy::Abort => write!(f, "abort"),
        }
    }
}

impl FromStr for ReconcileFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(ReconcileFailurePolicy::Continue),
            "abort" => Ok(ReconcileFailurePolicy::Abort),
            other => Err(format!(
                "unknown reconcile failure policy '{}', expected continue or abort",
                other
            )),
        }
    }
}

/// The subset of configuration the orchestrator itself acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub batch_size: usize,
    pub upsert_mode: UpsertMode,
    pub reconcile_failure_policy: ReconcileFailurePolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            upsert_mode: UpsertMode::default(),
            reconcile_failure_policy: ReconcileFailurePolicy::default(),
        }
    }
}

/// Configuration for a scoring run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Endpoints
    /// Model endpoint that scores a batch of comments.
    pub model_endpoint: String,
    /// Base URL of the PostgREST/Supabase store.
    pub storage_url: String,
    /// API key sent as `apikey` and bearer token.
    pub storage_api_key: String,
    /// Table holding `id, body` and the result columns.
    pub table: String,

    // Paging and batching
    /// Rows requested per page.
    pub page_size: usize,
    /// Records per model request.
    pub batch_size: usize,
    /// Stop reading after this many records.
    pub max_records: Option<usize>,
    /// Only read rows that have no sentiment yet.
    pub only_pending: bool,

    // Retry
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Cap on any single backoff delay.
    pub max_backoff: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Model calls allowed per minute.
    pub rate_limit_per_minute: Option<u32>,

    // Behaviour
    pub response_mode: ResponseMode,
    pub upsert_mode: UpsertMode,
    pub reconcile_failure_policy: ReconcileFailurePolicy,
    /// How often process memory is sampled.
    pub memory_sample_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_endpoint: "http://localhost:8000/analyze".to_string(),
            storage_url: "http://localhost:54321".to_string(),
            storage_api_key: String::new(),
            table: COMMENTS_TABLE.to_string(),

            page_size: 1000,
            batch_size: 100,
            max_records: None,
            only_pending: false,

            max_attempts: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(60),
            request_timeout: Duration::from_secs(120),
            rate_limit_per_minute: None,

            response_mode: ResponseMode::Auto,
            upsert_mode: UpsertMode::PerBatch,
            reconcile_failure_policy: ReconcileFailurePolicy::Continue,
            memory_sample_interval: Duration::from_millis(500),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MODEL_ENDPOINT_URL`: Model endpoint (required)
    /// - `SUPABASE_URL`: PostgREST base URL (required)
    /// - `SUPABASE_API_KEY`: PostgREST API key (required)
    /// - `COMMENTS_TABLE`: Table name (default: comments)
    /// - `PAGE_SIZE`: Rows per page (default: 1000)
    /// - `BATCH_SIZE`: Records per model request (default: 100)
    /// - `MAX_RECORDS`: Stop after this many records (default: unlimited)
    /// - `ONLY_PENDING`: Only rows without sentiment (default: false)
    /// - `RETRIES`: Total attempts per batch (default: 3)
    /// - `RETRY_DELAY_MS`: Initial backoff in milliseconds (default: 1000)
    /// - `MAX_BACKOFF_MS`: Backoff cap in milliseconds (default: 60000)
    /// - `REQUEST_TIMEOUT_SECS`: HTTP timeout (default: 120)
    /// - `RATE_LIMIT_PER_MINUTE`: Model calls per minute (default: unlimited)
    /// - `RESPONSE_MODE`: auto, unary or stream (default: auto)
    /// - `UPSERT_MODE`: per_batch or end_of_run (default: per_batch)
    /// - `RECONCILE_FAILURE_POLICY`: continue or abort (default: continue)
    /// - `MEMORY_SAMPLE_INTERVAL_MS`: Memory sampling period (default: 500)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`PipelineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let required =
            |key: &str| lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        // Endpoints
        config.model_endpoint = required("MODEL_ENDPOINT_URL")?;
        config.storage_url = required("SUPABASE_URL")?;
        config.storage_api_key = required("SUPABASE_API_KEY")?;

        if let Some(val) = lookup("COMMENTS_TABLE") {
            config.table = val;
        }

        // Paging and batching
        if let Some(val) = lookup("PAGE_SIZE") {
            config.page_size = parse_env_value(&val, "PAGE_SIZE")?;
        }

        if let Some(val) = lookup("BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "BATCH_SIZE")?;
        }

        if let Some(val) = lookup("MAX_RECORDS") {
            config.max_records = Some(parse_env_value(&val, "MAX_RECORDS")?);
        }

        if let Some(val) = lookup("ONLY_PENDING") {
            config.only_pending = parse_env_bool(&val, "ONLY_PENDING")?;
        }

        // Retry
        if let Some(val) = lookup("RETRIES") {
            config.max_attempts = parse_env_value(&val, "RETRIES")?;
        }

        if let Some(val) = lookup("RETRY_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "RETRY_DELAY_MS")?;
            config.initial_backoff = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("MAX_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "MAX_BACKOFF_MS")?;
            config.max_backoff = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RATE_LIMIT_PER_MINUTE") {
            config.rate_limit_per_minute = Some(parse_env_value(&val, "RATE_LIMIT_PER_MINUTE")?);
        }

        // Behaviour
        if let Some(val) = lookup("RESPONSE_MODE") {
            config.response_mode = parse_env_value(&val, "RESPONSE_MODE")?;
        }

        if let Some(val) = lookup("UPSERT_MODE") {
            config.upsert_mode = parse_env_value(&val, "UPSERT_MODE")?;
        }

        if let Some(val) = lookup("RECONCILE_FAILURE_POLICY") {
            config.reconcile_failure_policy = parse_env_value(&val, "RECONCILE_FAILURE_POLICY")?;
        }

        if let Some(val) = lookup("MEMORY_SAMPLE_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "MEMORY_SAMPLE_INTERVAL_MS")?;
            config.memory_sample_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Endpoint validation
        for (name, url) in [
            ("model_endpoint", &self.model_endpoint),
            ("storage_url", &self.storage_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, url
                )));
            }
        }

        if self.storage_api_key.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "storage_api_key cannot be empty".to_string(),
            ));
        }

        if self.table.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "table cannot be empty".to_string(),
            ));
        }

        // Paging and batching validation
        if self.page_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "page_size must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_records == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_records must be greater than 0 when set".to_string(),
            ));
        }

        // Retry validation
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::ValidationFailed(
                "max_backoff cannot be shorter than initial_backoff".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_per_minute == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "rate_limit_per_minute must be greater than 0 when set".to_string(),
            ));
        }

        if self.memory_sample_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "memory_sample_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy for model dispatch.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.initial_backoff).with_max_delay(self.max_backoff)
    }

    /// Settings the orchestrator acts on.
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            batch_size: self.batch_size,
            upsert_mode: self.upsert_mode,
            reconcile_failure_policy: self.reconcile_failure_policy,
        }
    }

    pub fn with_model_endpoint(mut self, url: impl Into<String>) -> Self {
        self.model_endpoint = url.into();
        self
    }

    pub fn with_storage(mut self, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.storage_url = url.into();
        self.storage_api_key = api_key.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_records(mut self, max: Option<usize>) -> Self {
        self.max_records = max;
        self
    }

    pub fn with_only_pending(mut self, only_pending: bool) -> Self {
        self.only_pending = only_pending;
        self
    }

    pub fn with_retries(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_rate_limit_per_minute(mut self, limit: Option<u32>) -> Self {
        self.rate_limit_per_minute = limit;
        self
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    pub fn with_upsert_mode(mut self, mode: UpsertMode) -> Self {
        self.upsert_mode = mode;
        self
    }

    pub fn with_reconcile_failure_policy(mut self, policy: ReconcileFailurePolicy) -> Self {
        self.reconcile_failure_policy = policy;
        self
    }
}

fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
