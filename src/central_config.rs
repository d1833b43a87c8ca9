//! Central configuration: remote settings applied without a restart.
//!
//! A background thread periodically fetches the collector's agent
//! configuration endpoint and swaps the result into a shared snapshot. The
//! trace model reads the snapshot on every new transaction; readers only
//! ever observe a complete snapshot (pointer swap, never in-place
//! mutation). On any poll failure the last-known-good snapshot stays in
//! effect and transaction creation is never blocked.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_executor::block_on;
use http::{header, Method, Request, StatusCode};

use crate::transport::HttpClient;

/// Remotely configurable settings, each `None` until the collector sets it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CentralConfig {
    /// Overrides the local transaction sample rate.
    pub transaction_sample_rate: Option<f64>,
    /// When `false`, the agent stops recording new transactions entirely.
    pub recording: Option<bool>,
}

impl CentralConfig {
    /// Parses the central config response body. The endpoint returns a flat
    /// JSON object whose values are strings (occasionally bare scalars);
    /// unknown keys are ignored so old agents tolerate new server options.
    pub(crate) fn from_json(body: &[u8]) -> Result<CentralConfig, serde_json::Error> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(body)?;
        let mut config = CentralConfig::default();
        for (key, value) in &raw {
            match key.as_str() {
                "transaction_sample_rate" => {
                    if let Some(rate) = scalar_f64(value) {
                        config.transaction_sample_rate = Some(rate.clamp(0.0, 1.0));
                    }
                }
                "recording" => {
                    config.recording = scalar_bool(value);
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

fn scalar_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn scalar_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Read-mostly holder of the active [`CentralConfig`].
///
/// Readers clone the inner `Arc`; the poller replaces it wholesale, so an
/// in-flight transaction never observes a half-applied update.
#[derive(Debug, Default)]
pub(crate) struct ConfigStore {
    current: RwLock<Arc<CentralConfig>>,
}

impl ConfigStore {
    pub(crate) fn get(&self) -> Arc<CentralConfig> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    pub(crate) fn set(&self, config: CentralConfig) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Arc::new(config);
        }
    }
}

/// Minimum poll interval, even when the collector asks for less.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct ConfigPoller {
    client: Arc<dyn HttpClient>,
    url: String,
    store: Arc<ConfigStore>,
    default_interval: Duration,
    etag: Option<String>,
    failure_logged: bool,
}

impl ConfigPoller {
    pub(crate) fn new(
        client: Arc<dyn HttpClient>,
        config: &crate::AgentConfig,
        store: Arc<ConfigStore>,
    ) -> Self {
        let mut url = format!(
            "{}/config/v1/agents?service.name={}",
            config.server_url,
            query_encode(&config.service_name)
        );
        if let Some(environment) = &config.environment {
            url.push_str("&environment=");
            url.push_str(&query_encode(environment));
        }
        ConfigPoller {
            client,
            url,
            store,
            default_interval: config.central_config_interval,
            etag: None,
            failure_logged: false,
        }
    }

    /// Poll loop run on a dedicated thread. The shutdown channel doubles as
    /// the interval timer: a message or a disconnect stops the loop.
    pub(crate) fn run(mut self, shutdown: Receiver<()>) {
        loop {
            let wait = self.poll_once();
            match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Performs one poll and returns how long to wait before the next one,
    /// honoring a collector-provided `Cache-Control: max-age`.
    pub(crate) fn poll_once(&mut self) -> Duration {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(&self.url)
            .header(header::ACCEPT, "application/json");
        if let Some(etag) = &self.etag {
            builder = builder.header(header::IF_NONE_MATCH, etag.clone());
        }
        let request = match builder.body(Bytes::new()) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(error = %err, "failed to build central config request");
                return self.default_interval;
            }
        };

        match block_on(self.client.send_bytes(request)) {
            Ok(response) => {
                let interval = cache_max_age(response.headers())
                    .map(|age| age.max(MIN_POLL_INTERVAL))
                    .unwrap_or(self.default_interval);
                self.apply_response(response.status(), response.headers().clone(), response.body());
                interval
            }
            Err(err) => {
                // Keep last-known-good config; log the first failure only.
                if !self.failure_logged {
                    tracing::warn!(error = %err, "central config poll failed, keeping previous configuration");
                    self.failure_logged = true;
                }
                self.default_interval
            }
        }
    }

    fn apply_response(&mut self, status: StatusCode, headers: http::HeaderMap, body: &Bytes) {
        match status {
            StatusCode::OK => match CentralConfig::from_json(body) {
                Ok(config) => {
                    self.etag = headers
                        .get(header::ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    tracing::debug!(?config, "applying central configuration");
                    self.store.set(config);
                    self.failure_logged = false;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "malformed central config payload, keeping previous configuration");
                }
            },
            StatusCode::NOT_MODIFIED => {
                tracing::trace!("central configuration unchanged");
            }
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                // Collector has central config disabled or unsupported.
                tracing::debug!(%status, "central configuration unavailable");
            }
            status => {
                tracing::debug!(%status, "unexpected central config response");
            }
        }
    }
}

fn cache_max_age(headers: &http::HeaderMap) -> Option<Duration> {
    let value = headers.get(header::CACHE_CONTROL)?.to_str().ok()?;
    value.split(',').find_map(|directive| {
        let directive = directive.trim();
        let seconds = directive.strip_prefix("max-age=")?;
        seconds.parse::<u64>().ok().map(Duration::from_secs)
    })
}

fn query_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
