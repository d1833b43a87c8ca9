//! The trace-wide sampling decision.

use std::sync::Arc;

use crate::central_config::ConfigStore;
use crate::propagation::TraceContext;

use super::random_unit_f64;

/// Decides, once per transaction, whether a trace is sampled.
///
/// A continued distributed trace always honors the caller's decision; local
/// roots roll against the effective sample rate, which is the central
/// configuration override when present and the local configuration
/// otherwise. Spans never re-decide.
#[derive(Debug)]
pub(crate) struct Sampler {
    local_rate: f64,
    config: Arc<ConfigStore>,
}

impl Sampler {
    pub(crate) fn new(local_rate: f64, config: Arc<ConfigStore>) -> Self {
        Sampler {
            local_rate: local_rate.clamp(0.0, 1.0),
            config,
        }
    }

    pub(crate) fn should_sample(&self, remote: Option<&TraceContext>) -> bool {
        if let Some(context) = remote {
            return context.sampled;
        }
        let snapshot = self.config.get();
        if snapshot.recording == Some(false) {
            return false;
        }
        let rate = snapshot
            .transaction_sample_rate
            .unwrap_or(self.local_rate)
            .clamp(0.0, 1.0);
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            random_unit_f64() < rate
        }
    }
}
