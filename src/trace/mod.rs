//! The trace model: transactions, spans, sampling, and the per-context
//! active-entity store.
//!
//! A *transaction* is the root unit of traced work (one request, one job
//! run). *Spans* are child units nested under a transaction or another span.
//! All entities sharing one trace id form a *trace*. The sampling decision
//! is made once per transaction and inherited by every descendant span, so a
//! trace is never half-sampled.

mod context;
mod id_generator;
mod sampler;
mod span;
mod transaction;

pub use context::{ActivationGuard, ActiveEntity, ContextStore};
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub(crate) use id_generator::{random_error_id, random_unit_f64};
pub(crate) use sampler::Sampler;
pub use span::Span;
pub use transaction::Transaction;
pub(crate) use transaction::SpanCounters;

use std::fmt;

use serde::Serialize;

/// A 16-byte trace identifier shared by all entities in one trace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid (all zeroes) trace id.
    pub const INVALID: TraceId = TraceId(0);

    /// Construct a trace id from its 32-char lowercase hex representation.
    pub fn from_hex(hex: &str) -> Option<TraceId> {
        if hex.len() != 32 {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(TraceId)
    }

    /// Converts the trace id into its 32-char lowercase hex representation.
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    /// Returns `false` for the all-zeroes id.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

/// An 8-byte identifier for a transaction or span.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    /// Invalid (all zeroes) span id.
    pub const INVALID: SpanId = SpanId(0);

    /// Construct a span id from its 16-char lowercase hex representation.
    pub fn from_hex(hex: &str) -> Option<SpanId> {
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(SpanId)
    }

    /// Converts the span id into its 16-char lowercase hex representation.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Returns `false` for the all-zeroes id.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

/// The outcome of a transaction or span.
///
/// If never set explicitly, the outcome is inferred at `end`: `Failure` when
/// an error was recorded against the entity, `Success` otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The unit of work completed normally.
    Success,
    /// The unit of work failed.
    Failure,
    /// The instrumentation could not tell.
    Unknown,
}

/// A scalar value attached to an entity as a label.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LabelValue {
    /// String label.
    String(String),
    /// Boolean label.
    Bool(bool),
    /// Numeric label.
    Number(f64),
}

impl From<&str> for LabelValue {
    fn from(value: &str) -> Self {
        LabelValue::String(value.to_owned())
    }
}

impl From<String> for LabelValue {
    fn from(value: String) -> Self {
        LabelValue::String(value)
    }
}

impl From<bool> for LabelValue {
    fn from(value: bool) -> Self {
        LabelValue::Bool(value)
    }
}

impl From<f64> for LabelValue {
    fn from(value: f64) -> Self {
        LabelValue::Number(value)
    }
}

impl From<i64> for LabelValue {
    fn from(value: i64) -> Self {
        LabelValue::Number(value as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_hex_round_trip() {
        let id = TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736u128);
        assert_eq!(id.to_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(TraceId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(TraceId::from_hex("tooshort"), None);
        assert_eq!(TraceId::from_hex(&"0".repeat(33)), None);
    }

    #[test]
    fn span_id_hex_round_trip() {
        let id = SpanId::from(0x00f0_67aa_0ba9_02b7u64);
        assert_eq!(id.to_hex(), "00f067aa0ba902b7");
        assert_eq!(SpanId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(SpanId::from_hex("00f067aa0ba902"), None);
    }

    #[test]
    fn label_values_serialize_as_scalars() {
        assert_eq!(
            serde_json::to_string(&LabelValue::from("a")).unwrap(),
            "\"a\""
        );
        assert_eq!(serde_json::to_string(&LabelValue::from(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&LabelValue::from(4i64)).unwrap(), "4.0");
    }

    #[test]
    fn outcome_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Outcome::Success).unwrap(), "\"success\"");
        assert_eq!(serde_json::to_string(&Outcome::Failure).unwrap(), "\"failure\"");
    }
}
