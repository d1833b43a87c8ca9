//! The encode-batch-send pipeline between the trace model and the
//! collector.
//!
//! Completed entities are buffered in a bounded [`queue`](self::queue),
//! serialized to the newline-delimited intake format, optionally
//! gzip-compressed, and posted to the collector's intake endpoint by a
//! dedicated sender thread with bounded, backed-off retries.

mod client;
pub(crate) mod encoder;
pub mod model;
mod queue;
pub(crate) mod sender;

pub use client::{HttpClient, HttpError};
pub use queue::OverflowPolicy;

#[cfg(not(feature = "reqwest-blocking"))]
pub(crate) use client::NoopClient;
pub(crate) use queue::{Control, EventQueue};
pub(crate) use sender::SenderHandle;
