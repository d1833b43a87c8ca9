//! In-memory test doubles for the transport seam.
//!
//! [`MockClient`] stands in for the collector: it records every request and
//! answers from a scripted queue, defaulting to an empty `202`. Intended
//! for this crate's own tests and for testing instrumentation built on top
//! of the agent; nothing here talks to a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

use crate::transport::{HttpClient, HttpError};
use crate::{Agent, AgentConfig};

/// A request as seen by the [`MockClient`], with headers lowercased for
/// convenient assertions.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    /// Request method.
    pub method: String,
    /// Full request URI.
    pub uri: String,
    /// Headers, keyed by lowercase name.
    pub headers: HashMap<String, String>,
    /// Raw request body.
    pub body: Bytes,
}

#[derive(Debug)]
enum Reply {
    Respond {
        status: u16,
        body: Bytes,
        headers: Vec<(String, String)>,
    },
    Fail(String),
}

#[derive(Debug, Default)]
struct MockState {
    requests: Vec<RecordedRequest>,
    replies: VecDeque<Reply>,
    fail_always: Option<String>,
}

/// Scriptable in-memory [`HttpClient`].
#[derive(Clone, Debug, Default)]
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    /// Creates a client that answers `202 {}` until scripted otherwise.
    pub fn new() -> Self {
        MockClient::default()
    }

    /// Queues one response.
    pub fn enqueue(&self, status: u16, body: &str, headers: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.replies.push_back(Reply::Respond {
            status,
            body: Bytes::from(body.to_owned()),
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        });
    }

    /// Queues one transport-level failure.
    pub fn fail_next(&self, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.replies.push_back(Reply::Fail(message.to_owned()));
    }

    /// Makes every request fail, scripted replies included.
    pub fn fail_always(&self, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.fail_always = Some(message.to_owned());
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Requests against the intake endpoint, decoded to NDJSON lines.
    pub fn intake_payloads(&self) -> Vec<Vec<serde_json::Value>> {
        self.requests()
            .iter()
            .filter(|request| request.uri.ends_with("/intake/v2/events"))
            .map(|request| {
                let body = if request.headers.get("content-encoding").map(String::as_str)
                    == Some("gzip")
                {
                    use std::io::Read;
                    let mut decoder = flate2::read::GzDecoder::new(&request.body[..]);
                    let mut decoded = Vec::new();
                    decoder
                        .read_to_end(&mut decoded)
                        .expect("intake body is valid gzip");
                    decoded
                } else {
                    request.body.to_vec()
                };
                String::from_utf8(body)
                    .expect("intake body is utf-8")
                    .lines()
                    .map(|line| serde_json::from_str(line).expect("intake line is json"))
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl HttpClient for MockClient {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let mut state = self.state.lock().unwrap();
        let recorded = RecordedRequest {
            method: request.method().to_string(),
            uri: request.uri().to_string(),
            headers: request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_ascii_lowercase(),
                        value.to_str().unwrap_or("").to_owned(),
                    )
                })
                .collect(),
            body: request.body().clone(),
        };
        state.requests.push(recorded);

        if let Some(message) = &state.fail_always {
            return Err(message.clone().into());
        }

        match state.replies.pop_front() {
            Some(Reply::Fail(message)) => Err(message.into()),
            Some(Reply::Respond {
                status,
                body,
                headers,
            }) => {
                let mut builder = Response::builder().status(status);
                for (name, value) in &headers {
                    builder = builder.header(name, value);
                }
                Ok(builder.body(body)?)
            }
            None => Ok(Response::builder()
                .status(202)
                .body(Bytes::from_static(b"{}"))?),
        }
    }
}

/// An agent wired to a [`MockClient`], with central config polling off and
/// timings suitable for tests.
pub fn test_agent() -> (Agent, MockClient) {
    let client = MockClient::new();
    // The sender thread fetches server information before its first batch,
    // consuming the front of the reply queue. Script it here so replies
    // enqueued by tests line up with their intake requests.
    client.enqueue(
        200,
        r#"{"version": "8.0.0", "build_date": "2021-09-16T02:05:39Z", "build_sha": "a183f675"}"#,
        &[],
    );
    let config = AgentConfig::builder()
        .with_service_name("test-service")
        .with_central_config(false)
        .with_flush_interval(std::time::Duration::from_secs(60))
        .build();
    let agent = Agent::builder()
        .with_config(config)
        .with_http_client(Arc::new(client.clone()))
        .build();
    (agent, client)
}
