//! The background sender: micro-batching, retries, backpressure.
//!
//! One dedicated thread owns the network. Producers only ever touch the
//! bounded queue, so ending a transaction never blocks on the collector.
//! Batches move through `PENDING -> SENDING -> {ACKED, FAILED}`: a batch is
//! pending while it accumulates, sending while an intake request (or a
//! retry of it) is in flight, acked on a 2xx response, and failed once the
//! retry budget is exhausted, at which point its events are dropped and
//! counted. Dropped data is a log line and a counter, never a crash.

use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_executor::block_on;
use http::{header, Method, Request, StatusCode};

use crate::config::RetryPolicy;
use crate::error::{TransportError, TransportResult};
use crate::AgentConfig;

use super::encoder::{encode_batch, EncodedBatch};
use super::model::{IntakeEvent, IntakeResponse, MetadataRecord, ServerInfo};
use super::queue::{Control, EventQueue, Work};
use super::HttpClient;

const INTAKE_PATH: &str = "/intake/v2/events";

/// Lifecycle of one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BatchState {
    /// Accumulating in the queue.
    Pending,
    /// An intake request is in flight.
    Sending,
    /// Accepted by the collector; the batch is gone for good.
    Acked,
    /// Retry budget exhausted; the batch was dropped.
    Failed,
}

/// Handle to the sender thread, owned by the agent.
#[derive(Debug)]
pub(crate) struct SenderHandle {
    queue: Arc<EventQueue>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SenderHandle {
    pub(crate) fn spawn(
        client: Arc<dyn HttpClient>,
        config: &AgentConfig,
        queue: Arc<EventQueue>,
        server_info: Arc<OnceLock<ServerInfo>>,
    ) -> Self {
        let worker = IntakeSender::new(client, config, Arc::clone(&queue), server_info);
        let thread = thread::Builder::new()
            .name("apm-intake-sender".to_owned())
            .spawn(move || worker.run())
            .ok();
        if thread.is_none() {
            tracing::warn!("failed to spawn intake sender thread; events will be dropped");
        }
        SenderHandle {
            queue,
            thread: Mutex::new(thread),
        }
    }

    /// Sends a control request and waits up to `timeout` for the sender to
    /// finish draining.
    pub(crate) fn request(
        &self,
        make: impl FnOnce(std::sync::mpsc::SyncSender<TransportResult>) -> Control,
        timeout: Duration,
    ) -> TransportResult {
        let (reply_tx, reply_rx) = sync_channel(1);
        self.queue.submit(make(reply_tx))?;
        reply_rx
            .recv_timeout(timeout)
            .map_err(|_| TransportError::FlushTimedOut(timeout))?
    }

    pub(crate) fn join(&self) {
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

/// The worker that runs on the sender thread.
pub(crate) struct IntakeSender {
    client: Arc<dyn HttpClient>,
    queue: Arc<EventQueue>,
    metadata: MetadataRecord,
    base_url: String,
    authorization: Option<String>,
    compression: bool,
    retry: RetryPolicy,
    flush_interval: Duration,
    max_batch_size: usize,
    server_info: Arc<OnceLock<ServerInfo>>,
}

impl IntakeSender {
    pub(crate) fn new(
        client: Arc<dyn HttpClient>,
        config: &AgentConfig,
        queue: Arc<EventQueue>,
        server_info: Arc<OnceLock<ServerInfo>>,
    ) -> Self {
        // An API key wins over a secret token when both are configured.
        let authorization = config
            .api_key
            .as_ref()
            .map(|key| format!("ApiKey {key}"))
            .or_else(|| config.secret_token.as_ref().map(|t| format!("Bearer {t}")));
        IntakeSender {
            client,
            queue,
            metadata: MetadataRecord::new(config),
            base_url: config.server_url.clone(),
            authorization,
            compression: config.compression,
            retry: config.retry.clone(),
            flush_interval: config.flush_interval,
            max_batch_size: config.max_batch_size,
            server_info,
        }
    }

    pub(crate) fn run(self) {
        self.fetch_server_info();
        loop {
            let Work { events, control } = self.queue.next_work(self.flush_interval, self.max_batch_size);
            if !events.is_empty() {
                self.send_batch(events);
            }
            match control {
                Some(Control::Flush(reply)) => {
                    let _ = reply.send(self.drain());
                }
                Some(Control::Shutdown(reply)) => {
                    let _ = reply.send(self.drain());
                    tracing::debug!("intake sender shutting down");
                    break;
                }
                None => {}
            }
        }
    }

    /// Sends everything buffered, batch by batch.
    fn drain(&self) -> TransportResult {
        let mut result = Ok(());
        loop {
            let events = self.queue.take_all();
            if events.is_empty() {
                return result;
            }
            for chunk_start in (0..events.len()).step_by(self.max_batch_size) {
                let chunk_end = (chunk_start + self.max_batch_size).min(events.len());
                let batch = events[chunk_start..chunk_end].to_vec();
                if self.send_batch(batch) == BatchState::Failed {
                    result = Err(TransportError::Other(
                        "one or more batches were dropped during drain".to_owned(),
                    ));
                }
            }
        }
    }

    /// Drives one batch through its state machine. Returns the terminal
    /// state.
    pub(crate) fn send_batch(&self, events: Vec<IntakeEvent>) -> BatchState {
        let mut state = BatchState::Pending;
        let encoded = match encode_batch(&self.metadata, &events, self.compression) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(error = %err, count = events.len(), "dropping unencodable batch");
                self.queue.record_dropped(events.len());
                return BatchState::Failed;
            }
        };

        let mut delay = self.retry.initial_delay_ms;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let jitter = generate_jitter(self.retry.jitter_ms);
                let backoff = delay.saturating_add(jitter).min(self.retry.max_delay_ms);
                thread::sleep(Duration::from_millis(backoff));
                delay = delay.saturating_mul(2).min(self.retry.max_delay_ms);
            }
            state = BatchState::Sending;
            match self.post_events(&encoded) {
                Ok(()) => return BatchState::Acked,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_retries + 1,
                        "intake request failed"
                    );
                }
            }
        }

        debug_assert_eq!(state, BatchState::Sending);
        self.queue.record_dropped(events.len());
        tracing::warn!(
            count = events.len(),
            "dropping batch after exhausting retry budget"
        );
        BatchState::Failed
    }

    /// One intake POST. A 2xx with per-record rejections is a success from
    /// the transport's point of view: resending a record the collector
    /// already refused would loop forever, so rejections are only logged.
    fn post_events(&self, encoded: &EncodedBatch) -> TransportResult {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", self.base_url, INTAKE_PATH))
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .header(header::USER_AGENT, user_agent());
        if encoded.compressed {
            builder = builder.header(header::CONTENT_ENCODING, "gzip");
        }
        if let Some(authorization) = &self.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization.clone());
        }
        let request = builder
            .body(encoded.body.clone())
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;

        let response = block_on(self.client.send_bytes(request))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Collector {
                status: status.as_u16(),
                body: truncated(response.body()),
            });
        }

        if let Ok(parsed) = serde_json::from_slice::<IntakeResponse>(response.body()) {
            for rejection in &parsed.errors {
                tracing::warn!(
                    message = %rejection.message,
                    document = rejection.document.as_deref().unwrap_or(""),
                    "collector rejected an event; not retrying"
                );
            }
        }
        tracing::trace!(events = encoded.events, "batch accepted");
        Ok(())
    }

    /// Fetches collector version/build info once, for compatibility checks.
    /// Failure is never fatal; the pipeline works without it.
    fn fetch_server_info(&self) {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/", self.base_url))
            .header(header::ACCEPT, "application/json")
            .header(header::USER_AGENT, user_agent());
        if let Some(authorization) = &self.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization.clone());
        }
        let Ok(request) = builder.body(Bytes::new()) else {
            return;
        };
        match block_on(self.client.send_bytes(request)) {
            Ok(response) if response.status() == StatusCode::OK => {
                match serde_json::from_slice::<ServerInfo>(response.body()) {
                    Ok(info) => {
                        tracing::info!(version = %info.version, "connected to collector");
                        let _ = self.server_info.set(info);
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "unparsable server information response");
                    }
                }
            }
            Ok(response) => {
                tracing::debug!(status = %response.status(), "unexpected server information response");
            }
            Err(err) => {
                tracing::debug!(error = %err, "failed to fetch server information");
            }
        }
    }
}

fn user_agent() -> String {
    format!("apm-agent-core/{}", env!("CARGO_PKG_VERSION"))
}

fn truncated(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    let mut text = text.into_owned();
    if text.len() > 256 {
        text.truncate(256);
        text.push_str("...");
    }
    text
}

// Cheap jitter without touching the id-generation rng.
fn generate_jitter(max_jitter: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos as u64 % max_jitter.saturating_add(1)
}
