//! The transaction entity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use crate::propagation::TraceContext;
use crate::transport::model::{
    epoch_micros, ErrorRecord, EventContext, Exception, IntakeEvent, SpanCount, TransactionRecord,
};
use crate::transport::EventQueue;

use super::id_generator::random_error_id;
use super::{ContextStore, LabelValue, Outcome, SpanId, TraceId};

/// Running tally of spans started and suppressed under one transaction.
/// Shared with every descendant span handle so children of spans count too.
#[derive(Debug, Default)]
pub(crate) struct SpanCounters {
    pub(crate) started: AtomicU32,
    pub(crate) dropped: AtomicU32,
}

#[derive(Debug)]
struct TransactionData {
    name: String,
    transaction_type: String,
    start_time: SystemTime,
    start_instant: Instant,
    result: Option<String>,
    outcome: Option<Outcome>,
    error_recorded: bool,
    labels: BTreeMap<String, LabelValue>,
    custom: serde_json::Map<String, serde_json::Value>,
}

/// The root unit of traced work.
///
/// A `Transaction` is a cheaply clonable handle; clones refer to the same
/// underlying entity. It is mutable until [`end`](Transaction::end) is
/// called once, after which every mutation and further `end` degrades to a
/// warned no-op. Nothing here returns an error to the caller.
#[derive(Clone, Debug)]
pub struct Transaction {
    trace_id: TraceId,
    id: SpanId,
    parent_id: Option<SpanId>,
    sampled: bool,
    data: Arc<Mutex<Option<TransactionData>>>,
    queue: Arc<EventQueue>,
    counters: Arc<SpanCounters>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        trace_id: TraceId,
        id: SpanId,
        remote: Option<&TraceContext>,
        sampled: bool,
        name: impl Into<String>,
        transaction_type: impl Into<String>,
        start_time: Option<SystemTime>,
        queue: Arc<EventQueue>,
    ) -> Self {
        let transaction = Transaction {
            trace_id,
            id,
            parent_id: remote.map(|r| r.parent_id),
            sampled,
            data: Arc::new(Mutex::new(Some(TransactionData {
                name: name.into(),
                transaction_type: transaction_type.into(),
                start_time: start_time.unwrap_or_else(SystemTime::now),
                start_instant: Instant::now(),
                result: None,
                outcome: None,
                error_recorded: false,
                labels: BTreeMap::new(),
                custom: serde_json::Map::new(),
            }))),
            queue,
            counters: Arc::new(SpanCounters::default()),
        };
        ContextStore::push(transaction.clone().into());
        transaction
    }

    /// The trace this transaction roots (or continues).
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The transaction's own id.
    pub fn id(&self) -> SpanId {
        self.id
    }

    /// Id of the remote parent when this transaction continues a
    /// distributed trace.
    pub fn parent_id(&self) -> Option<SpanId> {
        self.parent_id
    }

    /// Whether this trace was sampled. Decided exactly once, here.
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Whether the transaction can still be mutated.
    pub fn is_recording(&self) -> bool {
        self.data.lock().map(|data| data.is_some()).unwrap_or(false)
    }

    /// Correlation data for outgoing calls made while this transaction is
    /// the active entity.
    pub fn trace_context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id,
            parent_id: self.id,
            sampled: self.sampled,
            tracestate: None,
        }
    }

    /// Renames the transaction, e.g. once the route is known.
    pub fn set_name(&self, name: impl Into<String>) {
        self.with_data(|data| data.name = name.into());
    }

    /// Sets the transaction result, e.g. `HTTP 2xx`.
    pub fn set_result(&self, result: impl Into<String>) {
        self.with_data(|data| data.result = Some(result.into()));
    }

    /// Sets the outcome explicitly, overriding inference at `end`.
    pub fn set_outcome(&self, outcome: Outcome) {
        self.with_data(|data| data.outcome = Some(outcome));
    }

    /// Attaches a label.
    pub fn set_label(&self, key: impl Into<String>, value: impl Into<LabelValue>) {
        let (key, value) = (key.into(), value.into());
        self.with_data(|data| {
            data.labels.insert(key, value);
        });
    }

    /// Attaches free-form custom context.
    pub fn set_custom_context(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.with_data(|data| {
            data.custom.insert(key, value);
        });
    }

    /// Captures an error against this transaction. The transaction's
    /// outcome becomes `failure` unless explicitly overridden, and when the
    /// trace is sampled an error event is emitted immediately.
    pub fn record_error(&self, message: impl std::fmt::Display) {
        let message = message.to_string();
        let culprit = self.with_data(|data| {
            data.error_recorded = true;
            data.name.clone()
        });
        if !self.sampled {
            return;
        }
        self.queue.enqueue(IntakeEvent::Error(ErrorRecord {
            id: format!("{:032x}", random_error_id()),
            trace_id: Some(self.trace_id.to_hex()),
            transaction_id: Some(self.id.to_hex()),
            parent_id: Some(self.id.to_hex()),
            timestamp: epoch_micros(SystemTime::now()),
            culprit,
            exception: Exception {
                message,
                exception_type: None,
            },
        }));
    }

    /// Ends the transaction now.
    pub fn end(&self) {
        self.end_inner(None);
    }

    /// Ends the transaction at the supplied wall-clock time.
    pub fn end_with_timestamp(&self, timestamp: SystemTime) {
        self.end_inner(Some(timestamp));
    }

    fn end_inner(&self, timestamp: Option<SystemTime>) {
        let data = match self.data.lock().ok().and_then(|mut guard| guard.take()) {
            Some(data) => data,
            None => {
                tracing::warn!(
                    transaction_id = %self.id,
                    "transaction ended more than once; ignoring"
                );
                return;
            }
        };
        ContextStore::remove(self.id);

        if !self.sampled {
            return;
        }

        let duration = match timestamp {
            Some(end) => end
                .duration_since(data.start_time)
                .unwrap_or_default()
                .as_secs_f64(),
            None => data.start_instant.elapsed().as_secs_f64(),
        } * 1_000.0;

        let outcome = data.outcome.unwrap_or(if data.error_recorded {
            Outcome::Failure
        } else {
            Outcome::Success
        });

        self.queue.enqueue(IntakeEvent::Transaction(TransactionRecord {
            id: self.id.to_hex(),
            trace_id: self.trace_id.to_hex(),
            parent_id: self.parent_id.map(SpanId::to_hex),
            name: data.name,
            transaction_type: data.transaction_type,
            timestamp: epoch_micros(data.start_time),
            duration,
            result: data.result,
            outcome,
            sampled: true,
            span_count: SpanCount {
                started: self.counters.started.load(Ordering::Relaxed),
                dropped: self.counters.dropped.load(Ordering::Relaxed),
            },
            context: EventContext {
                tags: data.labels,
                custom: data.custom,
            }
            .into_option(),
        }));
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut TransactionData) -> T) -> Option<T> {
        self.data.lock().ok().and_then(|mut guard| guard.as_mut().map(f))
    }

    pub(crate) fn counters(&self) -> Arc<SpanCounters> {
        Arc::clone(&self.counters)
    }
}
