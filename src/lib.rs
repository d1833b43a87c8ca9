//! # APM Agent Core
//!
//! The tracing core of an application performance monitoring agent:
//! a transaction/span trace model with per-context activation, W3C trace
//! context propagation, and a batched, compressed, retrying transport to
//! an APM collector speaking the intake protocol.
//!
//! The crate deliberately contains no automatic instrumentation. It is the
//! foundation instrumentation is built on: either directly through
//! [`Agent`], or through the [`bridge`] layer that maps `tracing` spans
//! onto the trace model.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::time::Duration;
//! use apm_agent_core::{Agent, AgentConfig};
//!
//! let config = AgentConfig::builder()
//!     .with_service_name("checkout")
//!     .with_server_url("http://127.0.0.1:8200")
//!     .build();
//! let agent = Agent::builder().with_config(config).build();
//!
//! let transaction = agent.start_transaction("GET /", "request");
//! let span = agent.start_span("SELECT FROM orders", "db");
//! // ... do the work ...
//! span.end();
//! transaction.set_result("HTTP 2xx");
//! transaction.end();
//!
//! agent.shutdown().unwrap();
//! ```
//!
//! Everything on the tracing surface is infallible: misuse (ending twice,
//! labelling an ended entity, starting a span with no transaction) degrades
//! to a no-op instead of disturbing the host application. Delivery runs on
//! background threads; [`Agent::flush`] and [`Agent::shutdown`] are the
//! only calls that block.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod agent;
pub mod bridge;
pub mod central_config;
pub mod config;
pub mod error;
pub mod propagation;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;
pub mod trace;
pub mod transport;

pub use agent::{Agent, AgentBuilder, TransactionOptions};
pub use bridge::ApmLayer;
pub use central_config::CentralConfig;
pub use config::{AgentConfig, AgentConfigBuilder, RetryPolicy};
pub use error::{TransportError, TransportResult};
pub use propagation::{Extractor, Injector, TraceContext, TraceContextPropagator};
pub use trace::{
    ActivationGuard, ActiveEntity, ContextStore, LabelValue, Outcome, Span, SpanId, TraceId,
    Transaction,
};
pub use transport::{HttpClient, HttpError, OverflowPolicy};
