//! The HTTP seam between the agent and the collector.
//!
//! A minimal client interface so users can bring their own HTTP stack; the
//! background threads drive it to completion with a local executor, so
//! clients may be async or blocking. Persistent connections are the client's
//! concern: both bundled `reqwest` clients pool and reuse connections across
//! batches, and a collector closing an idle connection surfaces as an
//! ordinary retryable send error.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

/// Opaque error produced by an [`HttpClient`] implementation.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A minimal interface necessary for sending requests to the collector.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send the specified HTTP request with `Bytes` payload.
    ///
    /// Returns the HTTP response including the status code and body.
    /// Implementations must return `Ok` for non-2xx responses; the caller
    /// inspects the status itself. Errors mean the request could not be
    /// completed at all, e.g. a refused connection or a timeout.
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}

/// Placeholder client used when the agent is built without an HTTP client
/// and no default is available. Every send fails, which the sender treats
/// like any other transport error.
#[cfg(not(feature = "reqwest-blocking"))]
#[derive(Debug, Default)]
pub(crate) struct NoopClient;

#[cfg(not(feature = "reqwest-blocking"))]
#[async_trait]
impl HttpClient for NoopClient {
    async fn send_bytes(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        Err("no http client configured".into())
    }
}

#[cfg(feature = "reqwest-blocking")]
mod reqwest_blocking {
    use super::{async_trait, Bytes, HttpClient, HttpError, Request, Response};

    #[async_trait]
    impl HttpClient for reqwest::blocking::Client {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            tracing::trace!("sending intake request via reqwest blocking client");
            let (parts, body) = request.into_parts();
            let request = Request::from_parts(parts, body.to_vec()).try_into()?;
            let mut response = self.execute(request)?;
            let headers = std::mem::take(response.headers_mut());
            let mut http_response = Response::builder()
                .status(response.status())
                .body(Bytes::from(response.bytes()?))?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }
}
