//! Local agent configuration.
//!
//! This is the configuration the process starts with. A subset of it
//! (sampling rate, recording) can later be overridden by the central
//! configuration endpoint; see [`crate::central_config`]. Loading values
//! from the environment is deliberately left to the embedding application.

use std::time::Duration;

use crate::transport::OverflowPolicy;

/// Retry behavior for intake requests, with exponential backoff and jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial send.
    pub max_retries: usize,
    /// Initial delay in milliseconds before the first retry.
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds between retries.
    pub max_delay_ms: u64,
    /// Maximum jitter in milliseconds added to each delay.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter_ms: 100,
        }
    }
}

/// Static configuration of an [`Agent`](crate::Agent).
///
/// Build with [`AgentConfig::builder`]; every field has a usable default
/// except the service name.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Name of the instrumented service.
    pub service_name: String,
    /// Version of the instrumented service.
    pub service_version: Option<String>,
    /// Deployment environment, e.g. `production`.
    pub environment: Option<String>,
    /// Base URL of the collector, e.g. `http://127.0.0.1:8200`.
    pub server_url: String,
    /// Secret token sent as `Authorization: Bearer ...`.
    pub secret_token: Option<String>,
    /// API key sent as `Authorization: ApiKey ...`; takes precedence over
    /// the secret token when both are set.
    pub api_key: Option<String>,
    /// Fraction of root transactions to sample, in `0.0..=1.0`.
    pub transaction_sample_rate: f64,
    /// Spans started beyond this per-transaction limit become no-ops and
    /// are counted as dropped.
    pub max_spans_per_transaction: u32,
    /// Capture a stack trace for spans at least this long; `None` disables
    /// capture.
    pub span_stack_trace_min_duration: Option<Duration>,
    /// Capacity of the outgoing event queue.
    pub queue_capacity: usize,
    /// What to shed when the queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Send a batch once it holds this many events, even before the flush
    /// interval elapses.
    pub max_batch_size: usize,
    /// Send whatever is buffered at least this often.
    pub flush_interval: Duration,
    /// Retry behavior for failed intake requests.
    pub retry: RetryPolicy,
    /// gzip request bodies. The encoder falls back to uncompressed bodies
    /// if compression fails.
    pub compression: bool,
    /// Poll the central configuration endpoint.
    pub central_config: bool,
    /// Default central configuration poll interval; a collector-provided
    /// cache lifetime takes precedence.
    pub central_config_interval: Duration,
    /// How long `shutdown` may spend draining the queue.
    pub shutdown_timeout: Duration,
}

impl AgentConfig {
    /// Returns a builder with default values.
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfigBuilder::default().build()
    }
}

/// Builder for [`AgentConfig`].
#[derive(Clone, Debug)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl Default for AgentConfigBuilder {
    fn default() -> Self {
        AgentConfigBuilder {
            config: AgentConfig {
                service_name: "unknown-rust-service".to_owned(),
                service_version: None,
                environment: None,
                server_url: "http://127.0.0.1:8200".to_owned(),
                secret_token: None,
                api_key: None,
                transaction_sample_rate: 1.0,
                max_spans_per_transaction: 500,
                span_stack_trace_min_duration: None,
                queue_capacity: 1024,
                overflow_policy: OverflowPolicy::DropNewest,
                max_batch_size: 256,
                flush_interval: Duration::from_secs(10),
                retry: RetryPolicy::default(),
                compression: true,
                central_config: true,
                central_config_interval: Duration::from_secs(30),
                shutdown_timeout: Duration::from_secs(5),
            },
        }
    }
}

impl AgentConfigBuilder {
    /// Sets the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    /// Sets the service version.
    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.config.service_version = Some(version.into());
        self
    }

    /// Sets the deployment environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.config.environment = Some(environment.into());
        self
    }

    /// Sets the collector base URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        let mut url = url.into();
        while url.ends_with('/') {
            url.pop();
        }
        self.config.server_url = url;
        self
    }

    /// Sets the secret token.
    pub fn with_secret_token(mut self, token: impl Into<String>) -> Self {
        self.config.secret_token = Some(token.into());
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    /// Sets the sampling rate; values outside `0.0..=1.0` are clamped.
    pub fn with_transaction_sample_rate(mut self, rate: f64) -> Self {
        self.config.transaction_sample_rate = if rate.is_finite() {
            rate.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self
    }

    /// Sets the per-transaction span limit.
    pub fn with_max_spans_per_transaction(mut self, max: u32) -> Self {
        self.config.max_spans_per_transaction = max;
        self
    }

    /// Enables span stack trace capture for spans at least `min` long.
    pub fn with_span_stack_trace_min_duration(mut self, min: Duration) -> Self {
        self.config.span_stack_trace_min_duration = Some(min);
        self
    }

    /// Sets the event queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the queue overflow policy.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow_policy = policy;
        self
    }

    /// Sets the batch-size send threshold.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size.max(1);
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Enables or disables request body compression.
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.config.compression = compression;
        self
    }

    /// Enables or disables central configuration polling.
    pub fn with_central_config(mut self, enabled: bool) -> Self {
        self.config.central_config = enabled;
        self
    }

    /// Sets the default central configuration poll interval.
    pub fn with_central_config_interval(mut self, interval: Duration) -> Self {
        self.config.central_config_interval = interval;
        self
    }

    /// Sets the shutdown drain timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Finalizes the configuration.
    pub fn build(mut self) -> AgentConfig {
        if self.config.max_batch_size > self.config.queue_capacity {
            self.config.max_batch_size = self.config.queue_capacity;
        }
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_is_clamped() {
        let config = AgentConfig::builder()
            .with_transaction_sample_rate(7.5)
            .build();
        assert_eq!(config.transaction_sample_rate, 1.0);

        let config = AgentConfig::builder()
            .with_transaction_sample_rate(-1.0)
            .build();
        assert_eq!(config.transaction_sample_rate, 0.0);

        let config = AgentConfig::builder()
            .with_transaction_sample_rate(f64::NAN)
            .build();
        assert_eq!(config.transaction_sample_rate, 1.0);
    }

    #[test]
    fn batch_size_never_exceeds_queue_capacity() {
        let config = AgentConfig::builder()
            .with_queue_capacity(10)
            .with_max_batch_size(500)
            .build();
        assert_eq!(config.max_batch_size, 10);
    }

    #[test]
    fn server_url_trailing_slash_is_stripped() {
        let config = AgentConfig::builder()
            .with_server_url("http://apm.example.com:8200/")
            .build();
        assert_eq!(config.server_url, "http://apm.example.com:8200");
    }
}
