//! The span entity.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::transport::model::{
    epoch_micros, ErrorRecord, EventContext, Exception, IntakeEvent, SpanRecord, StackFrame,
};
use crate::transport::EventQueue;

use super::id_generator::random_error_id;
use super::{ContextStore, LabelValue, Outcome, SpanCounters, SpanId, TraceId};

#[derive(Debug)]
struct SpanData {
    name: String,
    span_type: String,
    subtype: Option<String>,
    action: Option<String>,
    start_time: SystemTime,
    start_instant: Instant,
    outcome: Option<Outcome>,
    error_recorded: bool,
    labels: BTreeMap<String, LabelValue>,
    /// Raw backtrace captured at start when stack trace collection is
    /// enabled; only attached to the record if the span turns out slow.
    backtrace: Option<String>,
    stack_trace_min_duration: Option<Duration>,
}

/// A child unit of work nested under a transaction or another span.
///
/// Like [`Transaction`](super::Transaction), a `Span` is a clonable handle,
/// mutable until ended once. Spans started with no active transaction, under
/// an unsampled transaction, or past the per-transaction span limit are
/// *inert*: the handle keeps full API symmetry but records nothing and is
/// never enqueued.
#[derive(Clone, Debug)]
pub struct Span {
    trace_id: TraceId,
    transaction_id: SpanId,
    parent_id: SpanId,
    id: SpanId,
    sampled: bool,
    inert: bool,
    data: Arc<Mutex<Option<SpanData>>>,
    queue: Arc<EventQueue>,
    counters: Option<Arc<SpanCounters>>,
}

impl Span {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        trace_id: TraceId,
        transaction_id: SpanId,
        parent_id: SpanId,
        id: SpanId,
        name: impl Into<String>,
        span_type: impl Into<String>,
        start_time: Option<SystemTime>,
        stack_trace_min_duration: Option<Duration>,
        queue: Arc<EventQueue>,
        counters: Arc<SpanCounters>,
    ) -> Self {
        counters.started.fetch_add(1, Ordering::Relaxed);
        let backtrace = stack_trace_min_duration
            .map(|_| std::backtrace::Backtrace::force_capture().to_string());
        let span = Span {
            trace_id,
            transaction_id,
            parent_id,
            id,
            sampled: true,
            inert: false,
            data: Arc::new(Mutex::new(Some(SpanData {
                name: name.into(),
                span_type: span_type.into(),
                subtype: None,
                action: None,
                start_time: start_time.unwrap_or_else(SystemTime::now),
                start_instant: Instant::now(),
                outcome: None,
                error_recorded: false,
                labels: BTreeMap::new(),
                backtrace,
                stack_trace_min_duration,
            }))),
            queue,
            counters: Some(counters),
        };
        ContextStore::push(span.clone().into());
        span
    }

    /// An inert span: full API, no recording, never enqueued.
    pub(crate) fn inert(queue: Arc<EventQueue>) -> Self {
        Span {
            trace_id: TraceId::INVALID,
            transaction_id: SpanId::INVALID,
            parent_id: SpanId::INVALID,
            id: SpanId::INVALID,
            sampled: false,
            inert: true,
            data: Arc::new(Mutex::new(None)),
            queue,
            counters: None,
        }
    }

    /// The trace this span belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The span's own id.
    pub fn id(&self) -> SpanId {
        self.id
    }

    /// Id of the owning transaction.
    pub fn transaction_id(&self) -> SpanId {
        self.transaction_id
    }

    /// Id of the direct parent (the transaction or an enclosing span).
    pub fn parent_id(&self) -> SpanId {
        self.parent_id
    }

    /// Sampling decision inherited from the owning transaction.
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Whether the span can still be mutated. `false` for inert spans.
    pub fn is_recording(&self) -> bool {
        self.data.lock().map(|data| data.is_some()).unwrap_or(false)
    }

    /// Correlation data for outgoing calls made while this span is the
    /// active entity.
    pub fn trace_context(&self) -> crate::propagation::TraceContext {
        crate::propagation::TraceContext {
            trace_id: self.trace_id,
            parent_id: self.id,
            sampled: self.sampled,
            tracestate: None,
        }
    }

    /// Renames the span.
    pub fn set_name(&self, name: impl Into<String>) {
        self.with_data(|data| data.name = name.into());
    }

    /// Sets type, subtype and action in one call, e.g.
    /// `("db", Some("postgresql"), Some("query"))`.
    pub fn set_type(
        &self,
        span_type: impl Into<String>,
        subtype: Option<&str>,
        action: Option<&str>,
    ) {
        let span_type = span_type.into();
        let subtype = subtype.map(str::to_owned);
        let action = action.map(str::to_owned);
        self.with_data(|data| {
            data.span_type = span_type;
            data.subtype = subtype;
            data.action = action;
        });
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

    /// Captures an error against this span; see
    /// [`Transaction::record_error`](super::Transaction::record_error).
    pub fn record_error(&self, message: impl std::fmt::Display) {
        if self.inert {
            return;
        }
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
            transaction_id: Some(self.transaction_id.to_hex()),
            parent_id: Some(self.id.to_hex()),
            timestamp: epoch_micros(SystemTime::now()),
            culprit,
            exception: Exception {
                message,
                exception_type: None,
            },
        }));
    }

    /// Ends the span now.
    pub fn end(&self) {
        self.end_inner(None);
    }

    /// Ends the span at the supplied wall-clock time.
    pub fn end_with_timestamp(&self, timestamp: SystemTime) {
        self.end_inner(Some(timestamp));
    }

    fn end_inner(&self, timestamp: Option<SystemTime>) {
        let data = match self.data.lock().ok().and_then(|mut guard| guard.take()) {
            Some(data) => data,
            None => {
                if !self.inert {
                    tracing::warn!(span_id = %self.id, "span ended more than once; ignoring");
                }
                return;
            }
        };
        ContextStore::remove(self.id);

        let duration = match timestamp {
            Some(end) => end.duration_since(data.start_time).unwrap_or_default(),
            None => data.start_instant.elapsed(),
        };

        let outcome = data.outcome.unwrap_or(if data.error_recorded {
            Outcome::Failure
        } else {
            Outcome::Success
        });

        let stacktrace = match (data.backtrace, data.stack_trace_min_duration) {
            (Some(raw), Some(min)) if duration >= min => {
                let frames = parse_backtrace(&raw);
                if frames.is_empty() {
                    None
                } else {
                    Some(frames)
                }
            }
            _ => None,
        };

        self.queue.enqueue(IntakeEvent::Span(SpanRecord {
            id: self.id.to_hex(),
            trace_id: self.trace_id.to_hex(),
            transaction_id: self.transaction_id.to_hex(),
            parent_id: self.parent_id.to_hex(),
            name: data.name,
            span_type: data.span_type,
            subtype: data.subtype,
            action: data.action,
            timestamp: epoch_micros(data.start_time),
            duration: duration.as_secs_f64() * 1_000.0,
            outcome,
            stacktrace,
            context: EventContext {
                tags: data.labels,
                custom: serde_json::Map::new(),
            }
            .into_option(),
        }));
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut SpanData) -> T) -> Option<T> {
        self.data.lock().ok().and_then(|mut guard| guard.as_mut().map(f))
    }

    pub(crate) fn counters(&self) -> Option<Arc<SpanCounters>> {
        self.counters.as_ref().map(Arc::clone)
    }
}

/// Parses the textual form of [`std::backtrace::Backtrace`] into intake
/// stack frames. The format is stable enough in practice: a numbered
/// function line, optionally followed by an indented `at file:line:col`
/// line.
fn parse_backtrace(raw: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim_start();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                let mut parts = location.rsplitn(3, ':');
                let _column = parts.next();
                let lineno = parts.next().and_then(|l| l.parse().ok());
                let filename = parts.next().map(str::to_owned);
                if filename.is_some() {
                    frame.filename = filename;
                    frame.lineno = lineno;
                } else {
                    frame.filename = Some(location.to_owned());
                }
            }
        } else if let Some((index, function)) = trimmed.split_once(':') {
            if index.chars().all(|c| c.is_ascii_digit()) && !index.is_empty() {
                frames.push(StackFrame {
                    function: function.trim().to_owned(),
                    filename: None,
                    lineno: None,
                });
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_backtrace_text() {
        let raw = "\
   0: apm_agent_core::trace::span::Span::start
             at ./src/trace/span.rs:62:23
   1: my_app::handle_request
             at ./src/main.rs:10:5
   2: std::rt::lang_start
";
        let frames = parse_backtrace(raw);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function, "apm_agent_core::trace::span::Span::start");
        assert_eq!(frames[0].filename.as_deref(), Some("./src/trace/span.rs"));
        assert_eq!(frames[0].lineno, Some(62));
        assert_eq!(frames[2].function, "std::rt::lang_start");
        assert_eq!(frames[2].filename, None);
    }

    #[test]
    fn garbage_backtrace_text_yields_no_frames() {
        assert!(parse_backtrace("not a backtrace").is_empty());
        assert!(parse_backtrace("").is_empty());
    }
}
