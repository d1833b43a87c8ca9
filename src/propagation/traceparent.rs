//! `traceparent` header encode/decode.

use crate::trace::{SpanId, TraceId};

use super::{
    Extractor, Injector, TraceContext, TRACEPARENT_HEADER, TRACEPARENT_LEGACY_HEADER,
    TRACESTATE_HEADER,
};

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;
const SAMPLED_FLAG: u8 = 0x01;

/// Encoder/decoder for the `traceparent`/`tracestate` header pair.
#[derive(Clone, Debug, Default)]
pub struct TraceContextPropagator {
    _private: (),
}

impl TraceContextPropagator {
    /// Create a new `TraceContextPropagator`.
    pub fn new() -> Self {
        TraceContextPropagator { _private: () }
    }

    /// Encodes `context` into the carrier. Both the standard and the legacy
    /// header names are written so either kind of receiver can continue the
    /// trace.
    pub fn inject(&self, context: &TraceContext, injector: &mut dyn Injector) {
        if !context.trace_id.is_valid() || !context.parent_id.is_valid() {
            return;
        }
        let header_value = format!(
            "{:02x}-{}-{}-{:02x}",
            SUPPORTED_VERSION,
            context.trace_id,
            context.parent_id,
            if context.sampled { SAMPLED_FLAG } else { 0 },
        );
        injector.set(TRACEPARENT_HEADER, header_value.clone());
        injector.set(TRACEPARENT_LEGACY_HEADER, header_value);
        if let Some(tracestate) = &context.tracestate {
            injector.set(TRACESTATE_HEADER, tracestate.clone());
        }
    }

    /// Decodes a remote context from the carrier. Any malformed input yields
    /// `None`; the caller then starts a new root trace.
    pub fn extract(&self, extractor: &dyn Extractor) -> Option<TraceContext> {
        let header_value = extractor
            .get(TRACEPARENT_HEADER)
            .or_else(|| extractor.get(TRACEPARENT_LEGACY_HEADER))?
            .trim();
        let mut context = parse_traceparent(header_value)?;
        context.tracestate = extractor
            .get(TRACESTATE_HEADER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
        Some(context)
    }
}

fn parse_traceparent(header_value: &str) -> Option<TraceContext> {
    let parts = header_value.split_terminator('-').collect::<Vec<&str>>();
    if parts.len() < 4 {
        return None;
    }

    // W3C requires the hex sections to be lowercase.
    if parts[..4]
        .iter()
        .any(|part| part.chars().any(|c| c.is_ascii_uppercase()))
    {
        return None;
    }

    if parts[0].len() != 2 {
        return None;
    }
    let version = u8::from_str_radix(parts[0], 16).ok()?;
    // For version 0 there must be exactly 4 sections; future versions may
    // append more.
    if version > MAX_VERSION || (version == 0 && parts.len() != 4) {
        return None;
    }

    let trace_id = TraceId::from_hex(parts[1])?;
    let parent_id = SpanId::from_hex(parts[2])?;

    if parts[3].len() != 2 {
        return None;
    }
    let flags = u8::from_str_radix(parts[3], 16).ok()?;

    if !trace_id.is_valid() || !parent_id.is_valid() {
        return None;
    }

    Some(TraceContext {
        trace_id,
        parent_id,
        sampled: flags & SAMPLED_FLAG == SAMPLED_FLAG,
        tracestate: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn extract(header: &str) -> Option<TraceContext> {
        let mut carrier = HashMap::new();
        carrier.insert(TRACEPARENT_HEADER.to_owned(), header.to_owned());
        TraceContextPropagator::new().extract(&carrier)
    }

    #[test]
    fn extracts_valid_headers() {
        let context =
            extract("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").unwrap();
        assert_eq!(context.trace_id.to_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(context.parent_id.to_hex(), "00f067aa0ba902b7");
        assert!(context.sampled);

        let context =
            extract("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00").unwrap();
        assert!(!context.sampled);

        // Future versions may carry extra sections.
        let context =
            extract("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra").unwrap();
        assert!(context.sampled);
    }

    #[rustfmt::skip]
    fn invalid_headers() -> Vec<(&'static str, &'static str)> {
        vec![
            ("0000-00000000000000000000000000000000-0000000000000000-01", "wrong version length"),
            ("00-ab00000000000000000000000000000000-cd00000000000000-01", "wrong trace id length"),
            ("00-ab000000000000000000000000000000-cd0000000000000000-01", "wrong span id length"),
            ("00-ab000000000000000000000000000000-cd00000000000000-0100", "wrong flags length"),
            ("qw-00000000000000000000000000000000-0000000000000000-01",   "bogus version"),
            ("00-qw000000000000000000000000000000-cd00000000000000-01",   "bogus trace id"),
            ("00-ab000000000000000000000000000000-qw00000000000000-01",   "bogus span id"),
            ("00-ab000000000000000000000000000000-cd00000000000000-qw",   "bogus flags"),
            ("A0-00000000000000000000000000000000-0000000000000000-01",   "upper case version"),
            ("00-AB000000000000000000000000000000-cd00000000000000-01",   "upper case trace id"),
            ("00-ab000000000000000000000000000000-CD00000000000000-01",   "upper case span id"),
            ("00-00000000000000000000000000000000-0000000000000000-01",   "zero trace id and span id"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",      "missing flags"),
            ("ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",   "version 255 is forbidden"),
            ("",                                                          "empty header"),
            ("complete garbage",                                          "not a traceparent at all"),
        ]
    }

    #[test]
    fn malformed_headers_yield_no_context() {
        for (header, reason) in invalid_headers() {
            assert!(extract(header).is_none(), "should reject: {reason}");
        }
    }

    #[test]
    fn missing_header_yields_no_context() {
        let carrier: HashMap<String, String> = HashMap::new();
        assert!(TraceContextPropagator::new().extract(&carrier).is_none());
    }

    #[test]
    fn legacy_header_is_accepted_when_standard_is_missing() {
        let mut carrier = HashMap::new();
        carrier.insert(
            TRACEPARENT_LEGACY_HEADER.to_owned(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_owned(),
        );
        assert!(TraceContextPropagator::new().extract(&carrier).is_some());
    }

    #[test]
    fn inject_extract_round_trip() {
        let context = TraceContext {
            trace_id: TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736u128),
            parent_id: SpanId::from(0x00f0_67aa_0ba9_02b7u64),
            sampled: true,
            tracestate: Some("es=s:1".to_owned()),
        };
        let propagator = TraceContextPropagator::new();
        let mut carrier = HashMap::new();
        propagator.inject(&context, &mut carrier);
        assert_eq!(
            carrier[TRACEPARENT_HEADER],
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
        assert_eq!(carrier[TRACEPARENT_HEADER], carrier[TRACEPARENT_LEGACY_HEADER]);

        let decoded = propagator.extract(&carrier).unwrap();
        assert_eq!(decoded, context);
    }

    #[test]
    fn invalid_context_is_not_injected() {
        let context = TraceContext {
            trace_id: TraceId::INVALID,
            parent_id: SpanId::from(1),
            sampled: true,
            tracestate: None,
        };
        let mut carrier: HashMap<String, String> = HashMap::new();
        TraceContextPropagator::new().inject(&context, &mut carrier);
        assert!(carrier.is_empty());
    }
}
