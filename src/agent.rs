//! The agent: one explicitly constructed core instance.
//!
//! An [`Agent`] owns the queue, the sender thread, and (when enabled) the
//! central config poller. It is cheaply clonable; clones share the same
//! core. Dropping the last clone triggers a best-effort shutdown, and
//! [`Agent::shutdown`] does the same explicitly with a bounded drain.
//! There is deliberately no process-wide singleton: the embedding
//! application constructs the agent and passes it (or its tracing layer)
//! where needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, SystemTime};

use crate::central_config::{ConfigPoller, ConfigStore};
use crate::config::AgentConfig;
use crate::error::{TransportError, TransportResult};
use crate::propagation::{Extractor, Injector, TraceContext, TraceContextPropagator};
use crate::trace::{
    ActiveEntity, ContextStore, IdGenerator, RandomIdGenerator, Sampler, Span, Transaction,
};
use crate::transport::model::ServerInfo;
use crate::transport::{Control, EventQueue, HttpClient, SenderHandle};

/// Optional parameters for [`Agent::start_transaction_with_options`].
#[derive(Debug, Default)]
pub struct TransactionOptions {
    /// Distributed trace context extracted from an incoming request. When
    /// present, the new transaction continues that trace and inherits its
    /// sampling decision.
    pub remote_context: Option<TraceContext>,
    /// Explicit start time; defaults to now.
    pub start_time: Option<SystemTime>,
}

struct AgentInner {
    config: AgentConfig,
    queue: Arc<EventQueue>,
    sampler: Sampler,
    id_generator: Box<dyn IdGenerator>,
    propagator: TraceContextPropagator,
    sender: SenderHandle,
    server_info: Arc<OnceLock<ServerInfo>>,
    poller_stop: Mutex<Option<(Sender<()>, thread::JoinHandle<()>)>>,
    is_shutdown: AtomicBool,
}

/// The tracing core instance.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("service_name", &self.inner.config.service_name)
            .field("is_shutdown", &self.inner.is_shutdown)
            .finish()
    }
}

impl Agent {
    /// Returns a builder for a new agent.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Starts a new root transaction and makes it the active entity of the
    /// calling context.
    pub fn start_transaction(
        &self,
        name: impl Into<String>,
        transaction_type: impl Into<String>,
    ) -> Transaction {
        self.start_transaction_with_options(name, transaction_type, TransactionOptions::default())
    }

    /// Starts a transaction continuing the distributed trace described by
    /// `remote`, or a new root trace when `remote` is `None`.
    pub fn start_transaction_with_remote(
        &self,
        name: impl Into<String>,
        transaction_type: impl Into<String>,
        remote: Option<TraceContext>,
    ) -> Transaction {
        self.start_transaction_with_options(
            name,
            transaction_type,
            TransactionOptions {
                remote_context: remote,
                start_time: None,
            },
        )
    }

    /// Starts a transaction with full control over the options.
    pub fn start_transaction_with_options(
        &self,
        name: impl Into<String>,
        transaction_type: impl Into<String>,
        options: TransactionOptions,
    ) -> Transaction {
        let inner = &self.inner;
        let remote = options.remote_context.as_ref();
        let sampled = !inner.is_shutdown.load(Ordering::Relaxed) && inner.sampler.should_sample(remote);
        let trace_id = remote
            .map(|r| r.trace_id)
            .unwrap_or_else(|| inner.id_generator.new_trace_id());
        Transaction::start(
            trace_id,
            inner.id_generator.new_span_id(),
            remote,
            sampled,
            name,
            transaction_type,
            options.start_time,
            Arc::clone(&inner.queue),
        )
    }

    /// Starts a span under the calling context's active entity and makes it
    /// the new active entity.
    ///
    /// When no transaction is active, or the active trace is unsampled, or
    /// the per-transaction span limit is reached, the returned span is an
    /// inert no-op handle: same API, nothing recorded, nothing transmitted.
    pub fn start_span(&self, name: impl Into<String>, span_type: impl Into<String>) -> Span {
        match ContextStore::active() {
            Some(parent) => self.start_span_with_parent(name, span_type, &parent),
            None => {
                tracing::debug!("span started with no active transaction; creating no-op span");
                Span::inert(Arc::clone(&self.inner.queue))
            }
        }
    }

    /// Starts a span under an explicitly passed parent, for callers that
    /// thread context by hand instead of relying on the per-context store.
    pub fn start_span_with_parent(
        &self,
        name: impl Into<String>,
        span_type: impl Into<String>,
        parent: &ActiveEntity,
    ) -> Span {
        let inner = &self.inner;
        if !parent.is_sampled() {
            return Span::inert(Arc::clone(&inner.queue));
        }
        let counters = match parent {
            ActiveEntity::Transaction(transaction) => transaction.counters(),
            ActiveEntity::Span(span) => match span.counters() {
                Some(counters) => counters,
                None => return Span::inert(Arc::clone(&inner.queue)),
            },
        };
        if counters.started.load(Ordering::Relaxed) >= inner.config.max_spans_per_transaction {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Span::inert(Arc::clone(&inner.queue));
        }
        Span::start(
            parent.trace_id(),
            parent.transaction_id(),
            parent.id(),
            inner.id_generator.new_span_id(),
            name,
            span_type,
            None,
            inner.config.span_stack_trace_min_duration,
            Arc::clone(&inner.queue),
            counters,
        )
    }

    /// The calling context's active entity, if any.
    pub fn current_entity(&self) -> Option<ActiveEntity> {
        ContextStore::active()
    }

    /// The transaction owning the calling context's active entity, if any.
    pub fn current_transaction(&self) -> Option<Transaction> {
        ContextStore::active_transaction()
    }

    /// Captures an error against the calling context's active entity, or as
    /// a trace-less error event when nothing is active.
    pub fn capture_error(&self, message: impl std::fmt::Display) {
        match ContextStore::active() {
            Some(entity) => entity.record_error(message),
            None => {
                use crate::transport::model::{ErrorRecord, Exception, IntakeEvent};
                self.inner.queue.enqueue(IntakeEvent::Error(ErrorRecord {
                    id: format!("{:032x}", crate::trace::random_error_id()),
                    trace_id: None,
                    transaction_id: None,
                    parent_id: None,
                    timestamp: crate::transport::model::epoch_micros(SystemTime::now()),
                    culprit: None,
                    exception: Exception {
                        message: message.to_string(),
                        exception_type: None,
                    },
                }));
            }
        }
    }

    /// Writes the calling context's trace context into `injector`, for
    /// outgoing requests. No-op when nothing is active.
    pub fn inject_context(&self, injector: &mut dyn Injector) {
        let context = match ContextStore::active() {
            Some(ActiveEntity::Transaction(transaction)) => transaction.trace_context(),
            Some(ActiveEntity::Span(span)) => span.trace_context(),
            None => return,
        };
        self.inner.propagator.inject(&context, injector);
    }

    /// Decodes a remote trace context from `extractor`. Malformed or absent
    /// headers yield `None`, and the caller starts a new root trace.
    pub fn extract_context(&self, extractor: &dyn Extractor) -> Option<TraceContext> {
        self.inner.propagator.extract(extractor)
    }

    /// A `tracing-subscriber` layer bridging `tracing` spans onto this
    /// agent; see [`crate::bridge::ApmLayer`].
    pub fn tracing_layer(&self) -> crate::bridge::ApmLayer {
        crate::bridge::ApmLayer::new(self.clone())
    }

    /// Collector version/build info, once the sender has fetched it.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.get().cloned()
    }

    /// Number of events shed so far by overflow, send failures, or
    /// post-shutdown enqueues.
    pub fn dropped_events(&self) -> u64 {
        self.inner.queue.dropped_events()
    }

    /// Blocks until everything currently buffered has been sent, or
    /// `timeout` elapses.
    pub fn flush(&self, timeout: Duration) -> TransportResult {
        if self.inner.is_shutdown.load(Ordering::Relaxed) {
            return Err(TransportError::AlreadyShutdown);
        }
        self.inner.sender.request(Control::Flush, timeout)
    }

    /// Drains the queue (bounded by the configured shutdown timeout) and
    /// stops the background threads. Failing to flush in time loses the
    /// remaining data but never hangs.
    pub fn shutdown(&self) -> TransportResult {
        self.inner.shutdown()
    }
}

impl AgentInner {
    fn shutdown(&self) -> TransportResult {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyShutdown);
        }

        if let Ok(mut guard) = self.poller_stop.lock() {
            if let Some((stop, handle)) = guard.take() {
                let _ = stop.send(());
                let _ = handle.join();
            }
        }

        let result = self
            .sender
            .request(Control::Shutdown, self.config.shutdown_timeout);
        match &result {
            // The sender never replied; it may still be mid-backoff. Leave
            // the thread behind rather than hang the caller.
            Err(TransportError::FlushTimedOut(timeout)) => {
                tracing::warn!(?timeout, "shutdown drain timed out; remaining events are lost");
            }
            _ => self.sender.join(),
        }
        result
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::SeqCst) {
            let _ = self.shutdown();
        }
    }
}

/// Builder for [`Agent`].
#[derive(Debug)]
pub struct AgentBuilder {
    config: AgentConfig,
    client: Option<Arc<dyn HttpClient>>,
    id_generator: Option<Box<dyn IdGenerator>>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        AgentBuilder {
            config: AgentConfig::default(),
            client: None,
            id_generator: None,
        }
    }
}

impl AgentBuilder {
    /// Sets the agent configuration.
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP client used for intake, server info, and central
    /// config requests. Defaults to a `reqwest` blocking client when the
    /// `reqwest-blocking` feature is enabled.
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Replaces the random id generator, e.g. with
    /// [`IncrementIdGenerator`](crate::trace::IncrementIdGenerator) in
    /// tests.
    pub fn with_id_generator(mut self, id_generator: Box<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// Builds the agent and starts its background threads.
    pub fn build(self) -> Agent {
        let config = self.config;
        let client = self.client.unwrap_or_else(default_client);
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Box::new(RandomIdGenerator::default()));

        let queue = Arc::new(EventQueue::new(config.queue_capacity, config.overflow_policy));
        let config_store = Arc::new(ConfigStore::default());
        let server_info = Arc::new(OnceLock::new());
        let sampler = Sampler::new(config.transaction_sample_rate, Arc::clone(&config_store));

        let sender = SenderHandle::spawn(
            Arc::clone(&client),
            &config,
            Arc::clone(&queue),
            Arc::clone(&server_info),
        );

        let poller_stop = if config.central_config {
            let poller = ConfigPoller::new(Arc::clone(&client), &config, config_store);
            let (stop_tx, stop_rx) = channel();
            thread::Builder::new()
                .name("apm-central-config".to_owned())
                .spawn(move || poller.run(stop_rx))
                .ok()
                .map(|handle| (stop_tx, handle))
        } else {
            None
        };

        Agent {
            inner: Arc::new(AgentInner {
                config,
                queue,
                sampler,
                id_generator,
                propagator: TraceContextPropagator::new(),
                sender,
                server_info,
                poller_stop: Mutex::new(poller_stop),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(feature = "reqwest-blocking")]
fn default_client() -> Arc<dyn HttpClient> {
    Arc::new(reqwest::blocking::Client::new())
}

#[cfg(not(feature = "reqwest-blocking"))]
fn default_client() -> Arc<dyn HttpClient> {
    tracing::warn!("no http client configured and the reqwest-blocking feature is disabled");
    Arc::new(crate::transport::NoopClient)
}
