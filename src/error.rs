//! Error types for the transport side of the agent.
//!
//! The tracing surface itself (starting and ending transactions and spans,
//! setting labels, recording errors) is infallible by construction: misuse
//! degrades to a warned no-op and nothing from the core propagates into the
//! host application's control flow. Fallibility is confined to the transport
//! pipeline, which is driven from background threads.

use std::time::Duration;

/// Errors that can occur while delivering events to the collector.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// The collector answered with a non-success status code.
    #[error("collector returned HTTP {status}: {body}")]
    Collector {
        /// HTTP status code returned by the collector.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },

    /// The underlying HTTP client failed to complete the request.
    #[error("http client error: {0}")]
    Http(#[from] crate::transport::HttpError),

    /// A request could not be constructed.
    #[error("invalid intake request: {0}")]
    InvalidRequest(String),

    /// Encoding a batch into the intake format failed.
    #[error("failed to encode intake payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// A flush or shutdown did not complete within the allotted time.
    #[error("flush timed out after {0:?}")]
    FlushTimedOut(Duration),

    /// The agent has already been shut down.
    #[error("agent is already shut down")]
    AlreadyShutdown,

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

/// Result type for transport operations.
pub type TransportResult<T = ()> = Result<T, TransportError>;

impl<T> From<std::sync::PoisonError<T>> for TransportError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TransportError::Other(err.to_string())
    }
}
