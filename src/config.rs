//! Configuration for the dispatch service.
//!
//! This module provides configuration options for endpoint pooling,
//! concurrency limits, circuit breaker behavior, retry backoff, batch
//! sizing, health probing, and the durable retry queue.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

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

/// Configuration for the dispatch service.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    // Endpoint settings
    /// Base URLs of the inference endpoints in the pool.
    pub endpoints: Vec<String>,
    /// Hard deadline for a single inference request.
    pub request_timeout: Duration,
    /// User-Agent header sent with every request.
    pub user_agent: String,

    // Concurrency settings
    /// Maximum in-flight requests across all endpoints.
    pub max_concurrency: usize,
    /// Maximum in-flight requests against a single endpoint.
    pub per_endpoint_concurrency: usize,
    /// Minimum interval between consecutive outbound requests.
    pub min_request_interval: Duration,

    // Circuit breaker settings
    /// Consecutive failures that trip an endpoint's circuit open.
    pub circuit_failure_threshold: u32,
    /// How long a tripped circuit stays open before a trial is allowed.
    pub circuit_open_duration: Duration,

    // Backoff settings
    /// Base delay for the first retry pass.
    pub backoff_base: Duration,
    /// Growth factor applied per retry pass.
    pub backoff_multiplier: f64,
    /// Upper bound on the computed delay, before jitter.
    pub backoff_cap: Duration,
    /// Maximum random jitter added on top of the computed delay.
    pub backoff_max_jitter: Duration,

    // Batch settings
    /// Number of items dispatched per chunk.
    pub batch_size: usize,
    /// Hard cap on the configured chunk size.
    pub max_batch_size: usize,
    /// Chunk size used when reprocessing items from the retry queue.
    pub retry_batch_size: usize,
    /// Additional synchronous passes over still-failing items.
    pub max_immediate_retries: u32,

    // Health settings
    /// Interval between health monitor ticks.
    pub health_check_interval: Duration,
    /// Deadline for a single health probe request.
    pub probe_timeout: Duration,
    /// Treat validation-style 4xx responses (400, 422) as alive during
    /// health probes. Some endpoints reject the probe parameters while
    /// being perfectly able to serve real traffic.
    pub probe_accept_validation_errors: bool,

    // Retry queue settings
    /// Interval between background retry sweeps.
    pub retry_sweep_interval: Duration,
    /// Background attempts before a job is abandoned.
    pub max_background_retries: u32,
    /// Wall-clock horizon after which a job is abandoned regardless of
    /// attempt count.
    pub give_up_after: Duration,
    /// Directory for the durable mirror of retry jobs.
    pub queue_dir: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            // Endpoint defaults
            endpoints: Vec::new(),
            request_timeout: Duration::from_secs(90),
            user_agent: format!("inferelay/{}", env!("CARGO_PKG_VERSION")),

            // Concurrency defaults
            max_concurrency: 16,
            per_endpoint_concurrency: 4,
            min_request_interval: Duration::from_millis(100),

            // Circuit breaker defaults
            circuit_failure_threshold: 3,
            circuit_open_duration: Duration::from_secs(60),

            // Backoff defaults
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_secs(30),
            backoff_max_jitter: Duration::from_secs(1),

            // Batch defaults
            batch_size: 16,
            max_batch_size: 50,
            retry_batch_size: 5,
            max_immediate_retries: 5,

            // Health defaults
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            probe_accept_validation_errors: true,

            // Retry queue defaults
            retry_sweep_interval: Duration::from_secs(60),
            max_background_retries: 10,
            give_up_after: Duration::from_secs(24 * 3600),
            queue_dir: PathBuf::from("./retry_queue"),
        }
    }
}

impl DispatchConfig {
    /// Creates a configuration with the given endpoints and default tuning.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAY_ENDPOINTS`: Comma-separated endpoint base URLs (required)
    /// - `RELAY_REQUEST_TIMEOUT_SECS`: Per-request deadline (default: 90)
    /// - `RELAY_USER_AGENT`: User-Agent header value
    /// - `RELAY_MAX_CONCURRENCY`: Global in-flight cap (default: 16)
    /// - `RELAY_PER_ENDPOINT_CONCURRENCY`: Per-endpoint cap (default: 4)
    /// - `RELAY_MIN_REQUEST_INTERVAL_MS`: Rate limit interval (default: 100)
    /// - `RELAY_CIRCUIT_FAILURE_THRESHOLD`: Failures to trip (default: 3)
    /// - `RELAY_CIRCUIT_OPEN_SECS`: Open duration (default: 60)
    /// - `RELAY_BACKOFF_BASE_MS`: Base retry delay (default: 1000)
    /// - `RELAY_BACKOFF_MULTIPLIER`: Growth factor (default: 2.0)
    /// - `RELAY_BACKOFF_CAP_MS`: Delay cap (default: 30000)
    /// - `RELAY_BACKOFF_MAX_JITTER_MS`: Max jitter (default: 1000)
    /// - `RELAY_BATCH_SIZE`: Chunk size (default: 16)
    /// - `RELAY_MAX_BATCH_SIZE`: Chunk size cap (default: 50)
    /// - `RELAY_RETRY_BATCH_SIZE`: Background chunk size (default: 5)
    /// - `RELAY_MAX_IMMEDIATE_RETRIES`: Synchronous passes (default: 5)
    /// - `RELAY_HEALTH_CHECK_INTERVAL_SECS`: Monitor tick (default: 30)
    /// - `RELAY_PROBE_TIMEOUT_SECS`: Probe deadline (default: 10)
    /// - `RELAY_PROBE_ACCEPT_VALIDATION_ERRORS`: Probe 400/422 as alive (default: true)
    /// - `RELAY_RETRY_SWEEP_INTERVAL_SECS`: Queue sweep tick (default: 60)
    /// - `RELAY_MAX_BACKGROUND_RETRIES`: Background attempts (default: 10)
    /// - `RELAY_GIVE_UP_AFTER_HOURS`: Give-up horizon (default: 24)
    /// - `RELAY_QUEUE_DIR`: Spool directory (default: ./retry_queue)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `RELAY_ENDPOINTS` is missing or any value
    /// fails to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Endpoint settings - RELAY_ENDPOINTS is required
        let endpoints = std::env::var("RELAY_ENDPOINTS")
            .map_err(|_| ConfigError::MissingEnvVar("RELAY_ENDPOINTS".to_string()))?;
        config.endpoints = endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if let Ok(val) = std::env::var("RELAY_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RELAY_REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("RELAY_USER_AGENT") {
            config.user_agent = val;
        }

        // Concurrency settings
        if let Ok(val) = std::env::var("RELAY_MAX_CONCURRENCY") {
            config.max_concurrency = parse_env_value(&val, "RELAY_MAX_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("RELAY_PER_ENDPOINT_CONCURRENCY") {
            config.per_endpoint_concurrency =
                parse_env_value(&val, "RELAY_PER_ENDPOINT_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("RELAY_MIN_REQUEST_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "RELAY_MIN_REQUEST_INTERVAL_MS")?;
            config.min_request_interval = Duration::from_millis(ms);
        }

        // Circuit breaker settings
        if let Ok(val) = std::env::var("RELAY_CIRCUIT_FAILURE_THRESHOLD") {
            config.circuit_failure_threshold =
                parse_env_value(&val, "RELAY_CIRCUIT_FAILURE_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("RELAY_CIRCUIT_OPEN_SECS") {
            let secs: u64 = parse_env_value(&val, "RELAY_CIRCUIT_OPEN_SECS")?;
            config.circuit_open_duration = Duration::from_secs(secs);
        }

        // Backoff settings
        if let Ok(val) = std::env::var("RELAY_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "RELAY_BACKOFF_BASE_MS")?;
            config.backoff_base = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("RELAY_BACKOFF_MULTIPLIER") {
            config.backoff_multiplier = parse_env_value(&val, "RELAY_BACKOFF_MULTIPLIER")?;
        }

        if let Ok(val) = std::env::var("RELAY_BACKOFF_CAP_MS") {
            let ms: u64 = parse_env_value(&val, "RELAY_BACKOFF_CAP_MS")?;
            config.backoff_cap = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("RELAY_BACKOFF_MAX_JITTER_MS") {
            let ms: u64 = parse_env_value(&val, "RELAY_BACKOFF_MAX_JITTER_MS")?;
            config.backoff_max_jitter = Duration::from_millis(ms);
        }

        // Batch settings
        if let Ok(val) = std::env::var("RELAY_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "RELAY_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("RELAY_MAX_BATCH_SIZE") {
            config.max_batch_size = parse_env_value(&val, "RELAY_MAX_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("RELAY_RETRY_BATCH_SIZE") {
            config.retry_batch_size = parse_env_value(&val, "RELAY_RETRY_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("RELAY_MAX_IMMEDIATE_RETRIES") {
            config.max_immediate_retries = parse_env_value(&val, "RELAY_MAX_IMMEDIATE_RETRIES")?;
        }

        // Health settings
        if let Ok(val) = std::env::var("RELAY_HEALTH_CHECK_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "RELAY_HEALTH_CHECK_INTERVAL_SECS")?;
            config.health_check_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("RELAY_PROBE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RELAY_PROBE_TIMEOUT_SECS")?;
            config.probe_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("RELAY_PROBE_ACCEPT_VALIDATION_ERRORS") {
            config.probe_accept_validation_errors =
                parse_env_bool(&val, "RELAY_PROBE_ACCEPT_VALIDATION_ERRORS")?;
        }

        // Retry queue settings
        if let Ok(val) = std::env::var("RELAY_RETRY_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "RELAY_RETRY_SWEEP_INTERVAL_SECS")?;
            config.retry_sweep_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("RELAY_MAX_BACKGROUND_RETRIES") {
            config.max_background_retries = parse_env_value(&val, "RELAY_MAX_BACKGROUND_RETRIES")?;
        }

        if let Ok(val) = std::env::var("RELAY_GIVE_UP_AFTER_HOURS") {
            let hours: u64 = parse_env_value(&val, "RELAY_GIVE_UP_AFTER_HOURS")?;
            config.give_up_after = Duration::from_secs(hours * 3600);
        }

        if let Ok(val) = std::env::var("RELAY_QUEUE_DIR") {
            config.queue_dir = PathBuf::from(val);
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
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one endpoint URL is required".to_string(),
            ));
        }

        for url in &self.endpoints {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationFailed(format!(
                    "endpoint '{}' is not an http(s) URL",
                    url
                )));
            }
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.per_endpoint_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "per_endpoint_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "circuit_failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.batch_size == 0 || self.retry_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch sizes must be greater than 0".to_string(),
            ));
        }

        if self.batch_size > self.max_batch_size {
            return Err(ConfigError::ValidationFailed(format!(
                "batch_size ({}) exceeds max_batch_size ({})",
                self.batch_size, self.max_batch_size
            )));
        }

        if self.give_up_after.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "give_up_after must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective chunk size: the configured size clamped to the cap.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.min(self.max_batch_size)
    }
}

/// Parses an environment variable value, mapping errors to `ConfigError`.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable ("true"/"false"/"1"/"0").
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", other),
        }),
    }
}
