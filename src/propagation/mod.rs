//! Distributed trace-context propagation.
//!
//! The correlation data crossing process boundaries is the W3C
//! `traceparent` header, `version-traceid-parentid-flags`, optionally
//! accompanied by `tracestate`. The agent additionally writes the legacy
//! `elastic-apm-traceparent` header for older receivers, and accepts it on
//! extraction when the standard header is missing. Malformed headers decode
//! to "no context": the caller starts a new root trace instead of failing.

mod traceparent;

pub use traceparent::TraceContextPropagator;

use crate::trace::{SpanId, TraceId};

/// Standard W3C propagation header.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Legacy header written alongside [`TRACEPARENT_HEADER`].
pub const TRACEPARENT_LEGACY_HEADER: &str = "elastic-apm-traceparent";
/// Vendor-specific companion header, carried opaquely.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Decoded correlation data from a remote caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// The trace to continue.
    pub trace_id: TraceId,
    /// The caller's transaction or span id, the new transaction's parent.
    pub parent_id: SpanId,
    /// The caller's sampling decision; bit 0 of the flags byte.
    pub sampled: bool,
    /// Opaque `tracestate` value, re-emitted on injection.
    pub tracestate: Option<String>,
}

/// Sets propagation fields on an outgoing carrier (HTTP headers, message
/// attributes).
pub trait Injector {
    /// Set a key/value pair on the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Reads propagation fields from an incoming carrier.
pub trait Extractor {
    /// Get the value of the given key, if present.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Injector for std::collections::HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_owned(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for std::collections::HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl Injector for http::HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = http::header::HeaderName::from_bytes(key.as_bytes()) {
            if let Ok(value) = http::header::HeaderValue::from_str(&value) {
                self.insert(name, value);
            }
        }
    }
}

impl Extractor for http::HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| value.to_str().ok())
    }
}
