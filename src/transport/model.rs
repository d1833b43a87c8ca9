//! Serializable shapes of the intake protocol.
//!
//! Every completed entity is serialized as one self-contained,
//! newline-delimited record. A request body starts with one `metadata`
//! record describing the service, followed by `transaction`, `span` and
//! `error` records in arbitrary order; the collector reassembles traces by
//! trace id regardless of arrival order.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::trace::{LabelValue, Outcome};

/// Microseconds since the Unix epoch, the intake timestamp unit.
pub(crate) fn epoch_micros(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A finalized entity wrapped for serialization.
///
/// Serializes to the externally tagged intake line shape, e.g.
/// `{"transaction": {...}}`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntakeEvent {
    /// A completed transaction.
    Transaction(TransactionRecord),
    /// A completed span.
    Span(SpanRecord),
    /// A captured error.
    Error(ErrorRecord),
}

impl IntakeEvent {
    /// Trace id of the wrapped record, for tests and diagnostics.
    pub fn trace_id(&self) -> &str {
        match self {
            IntakeEvent::Transaction(t) => &t.trace_id,
            IntakeEvent::Span(s) => &s.trace_id,
            IntakeEvent::Error(e) => e.trace_id.as_deref().unwrap_or(""),
        }
    }
}

/// Wire form of a completed transaction.
#[derive(Clone, Debug, Serialize)]
pub struct TransactionRecord {
    /// Hex transaction id.
    pub id: String,
    /// Hex trace id.
    pub trace_id: String,
    /// Hex id of the remote parent, when continuing a distributed trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Transaction name, e.g. `GET /`.
    pub name: String,
    /// Transaction type, e.g. `request`.
    #[serde(rename = "type")]
    pub transaction_type: String,
    /// Start time in microseconds since the epoch.
    pub timestamp: u64,
    /// Duration in milliseconds.
    pub duration: f64,
    /// Result of the transaction, e.g. an HTTP status class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Success/failure outcome.
    pub outcome: Outcome,
    /// Whether the trace was sampled. Unsampled transactions are never
    /// transmitted, so this is always `true` on the wire.
    pub sampled: bool,
    /// Child span accounting.
    pub span_count: SpanCount,
    /// Labels and custom context, when any were set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContext>,
}

/// Child span accounting for a transaction.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SpanCount {
    /// Spans started under the transaction.
    pub started: u32,
    /// Spans suppressed after the per-transaction limit was hit.
    pub dropped: u32,
}

/// Wire form of a completed span.
#[derive(Clone, Debug, Serialize)]
pub struct SpanRecord {
    /// Hex span id.
    pub id: String,
    /// Hex trace id.
    pub trace_id: String,
    /// Hex id of the owning transaction.
    pub transaction_id: String,
    /// Hex id of the direct parent (the transaction or another span).
    pub parent_id: String,
    /// Span name, e.g. `SELECT FROM users`.
    pub name: String,
    /// Span type, e.g. `db`.
    #[serde(rename = "type")]
    pub span_type: String,
    /// Span subtype, e.g. `postgresql`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Span action, e.g. `query`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Start time in microseconds since the epoch.
    pub timestamp: u64,
    /// Duration in milliseconds.
    pub duration: f64,
    /// Success/failure outcome.
    pub outcome: Outcome,
    /// Stack frames captured for slow spans, when enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Vec<StackFrame>>,
    /// Labels, when any were set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContext>,
}

/// One frame of a captured stack trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    /// Function name.
    pub function: String,
    /// Source file, when resolvable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Line number, when resolvable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
}

/// Wire form of a captured error.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    /// Hex error id (128-bit).
    pub id: String,
    /// Hex trace id, when captured inside a trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Hex id of the owning transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Hex id of the entity the error was recorded against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Capture time in microseconds since the epoch.
    pub timestamp: u64,
    /// Best-effort description of where the error originated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub culprit: Option<String>,
    /// The captured exception.
    pub exception: Exception,
}

/// Message and type of a captured error.
#[derive(Clone, Debug, Serialize)]
pub struct Exception {
    /// Error message.
    pub message: String,
    /// Error type name, when known.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
}

/// Labels and free-form custom context attached to an entity.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EventContext {
    /// String/bool/number labels, indexed by the collector.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, LabelValue>,
    /// Free-form structured data, stored but not indexed.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl EventContext {
    pub(crate) fn into_option(self) -> Option<EventContext> {
        if self.tags.is_empty() && self.custom.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

/// The `metadata` record sent as the first line of every intake request.
#[derive(Clone, Debug, Serialize)]
pub struct MetadataRecord {
    /// Identity of the instrumented service.
    pub service: ServiceMetadata,
    /// Identity of the host process.
    pub process: ProcessMetadata,
}

/// Service identity within the metadata record.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceMetadata {
    /// Service name.
    pub name: String,
    /// Service version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Deployment environment, e.g. `production`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// The agent reporting on the service's behalf.
    pub agent: AgentMetadata,
    /// Language of the instrumented service.
    pub language: LanguageMetadata,
}

/// Agent name and version.
#[derive(Clone, Debug, Serialize)]
pub struct AgentMetadata {
    /// Agent name.
    pub name: &'static str,
    /// Agent version.
    pub version: &'static str,
}

/// Language name.
#[derive(Clone, Debug, Serialize)]
pub struct LanguageMetadata {
    /// Language name.
    pub name: &'static str,
}

/// Process identity.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessMetadata {
    /// Process id.
    pub pid: u32,
}

impl MetadataRecord {
    pub(crate) fn new(config: &crate::AgentConfig) -> Self {
        MetadataRecord {
            service: ServiceMetadata {
                name: config.service_name.clone(),
                version: config.service_version.clone(),
                environment: config.environment.clone(),
                agent: AgentMetadata {
                    name: "apm-agent-core",
                    version: env!("CARGO_PKG_VERSION"),
                },
                language: LanguageMetadata { name: "rust" },
            },
            process: ProcessMetadata {
                pid: std::process::id(),
            },
        }
    }
}

/// Response document of the server information endpoint (`GET /`).
#[derive(Clone, Debug, Deserialize)]
pub struct ServerInfo {
    /// Collector version, used for compatibility checks.
    pub version: String,
    /// Collector build date.
    #[serde(default)]
    pub build_date: Option<String>,
    /// Collector build revision.
    #[serde(default)]
    pub build_sha: Option<String>,
}

/// Body of a 2xx intake response, possibly enumerating rejected records.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IntakeResponse {
    /// Number of records the collector accepted.
    #[serde(default)]
    pub accepted: u64,
    /// Per-record rejections. Rejected records are logged, never resent.
    #[serde(default)]
    pub errors: Vec<IntakeRejection>,
}

/// A single rejected record within an otherwise accepted batch.
#[derive(Clone, Debug, Deserialize)]
pub struct IntakeRejection {
    /// Rejection reason.
    pub message: String,
    /// The offending document, when echoed back.
    #[serde(default)]
    pub document: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_events_are_externally_tagged() {
        let record = TransactionRecord {
            id: "0102030405060708".into(),
            trace_id: "0102030405060708090a0b0c0d0e0f10".into(),
            parent_id: None,
            name: "GET /".into(),
            transaction_type: "request".into(),
            timestamp: 1_000_000,
            duration: 50.0,
            result: Some("HTTP 2xx".into()),
            outcome: Outcome::Success,
            sampled: true,
            span_count: SpanCount {
                started: 1,
                dropped: 0,
            },
            context: None,
        };
        let line = serde_json::to_string(&IntakeEvent::Transaction(record)).unwrap();
        assert!(line.starts_with("{\"transaction\":{"), "got: {line}");
        assert!(line.contains("\"type\":\"request\""));
        assert!(!line.contains("parent_id"));
    }

    #[test]
    fn empty_context_collapses_to_none() {
        assert!(EventContext::default().into_option().is_none());

        let mut context = EventContext::default();
        context.tags.insert("k".into(), LabelValue::from("v"));
        assert!(context.into_option().is_some());
    }

    #[test]
    fn intake_response_tolerates_empty_body_fields() {
        let response: IntakeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response.accepted, 0);
        assert!(response.errors.is_empty());
    }
}
