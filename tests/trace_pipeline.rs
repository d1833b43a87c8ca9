//! End-to-end tests driving the public API against an in-memory collector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use apm_agent_core::testing::{test_agent, MockClient};
use apm_agent_core::{
    Agent, AgentConfig, Outcome, SpanId, TraceContext, TraceId, TransportError,
};

fn agent_with_config(config: AgentConfig) -> (Agent, MockClient) {
    let client = MockClient::new();
    let agent = Agent::builder()
        .with_config(config)
        .with_http_client(Arc::new(client.clone()))
        .build();
    (agent, client)
}

#[test]
fn request_with_db_span_produces_two_correlated_events() {
    let (agent, client) = test_agent();

    let transaction = agent.start_transaction("GET /", "request");
    let span = agent.start_span("SELECT FROM users", "db");
    span.set_type("db", Some("postgresql"), Some("query"));
    std::thread::sleep(Duration::from_millis(5));
    span.end();
    transaction.set_result("HTTP 2xx");
    transaction.end();

    agent.flush(Duration::from_secs(5)).unwrap();

    let payloads = client.intake_payloads();
    assert_eq!(payloads.len(), 1);
    let lines = &payloads[0];
    assert_eq!(lines.len(), 3);

    let metadata = &lines[0]["metadata"];
    assert_eq!(metadata["service"]["name"], "test-service");
    assert_eq!(metadata["service"]["language"]["name"], "rust");

    let span_record = &lines[1]["span"];
    let transaction_record = &lines[2]["transaction"];
    assert_eq!(span_record["name"], "SELECT FROM users");
    assert_eq!(span_record["type"], "db");
    assert_eq!(span_record["subtype"], "postgresql");
    assert_eq!(transaction_record["name"], "GET /");
    assert_eq!(transaction_record["result"], "HTTP 2xx");
    assert_eq!(transaction_record["outcome"], "success");

    // Same trace, span parented under the transaction, nested duration.
    assert_eq!(span_record["trace_id"], transaction_record["trace_id"]);
    assert_eq!(span_record["parent_id"], transaction_record["id"]);
    assert_eq!(span_record["transaction_id"], transaction_record["id"]);
    assert!(
        span_record["duration"].as_f64().unwrap()
            <= transaction_record["duration"].as_f64().unwrap()
    );
    assert_eq!(transaction_record["span_count"]["started"], 1);
    assert_eq!(transaction_record["span_count"]["dropped"], 0);
}

#[test]
fn ending_twice_emits_a_single_event() {
    let (agent, client) = test_agent();

    let transaction = agent.start_transaction("job", "worker");
    transaction.end();
    transaction.end();
    transaction.set_label("late", true);

    agent.flush(Duration::from_secs(5)).unwrap();

    let lines = &client.intake_payloads()[0];
    assert_eq!(lines.len(), 2);
    assert!(lines[1].get("transaction").is_some());
    assert!(lines[1]["transaction"]["context"].is_null());
}

#[test]
fn remote_unsampled_trace_transmits_nothing() {
    let (agent, client) = test_agent();

    let remote = TraceContext {
        trace_id: TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
        parent_id: SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        sampled: false,
        tracestate: None,
    };
    let transaction = agent.start_transaction_with_remote("GET /", "request", Some(remote));
    assert!(!transaction.is_sampled());

    let span = agent.start_span("child", "app");
    assert!(!span.is_recording());
    span.end();
    transaction.end();

    agent.flush(Duration::from_secs(5)).unwrap();
    assert!(client.intake_payloads().is_empty());
}

#[test]
fn remote_sampled_trace_is_continued() {
    let (agent, client) = test_agent();

    let remote = TraceContext {
        trace_id: TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
        parent_id: SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        sampled: true,
        tracestate: None,
    };
    let transaction =
        agent.start_transaction_with_remote("GET /", "request", Some(remote.clone()));
    assert!(transaction.is_sampled());
    transaction.end();

    agent.flush(Duration::from_secs(5)).unwrap();
    let record = &client.intake_payloads()[0][1]["transaction"];
    assert_eq!(record["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
    assert_eq!(record["parent_id"], "00f067aa0ba902b7");
}

#[test]
fn spans_beyond_the_limit_are_counted_as_dropped() {
    let config = AgentConfig::builder()
        .with_service_name("test-service")
        .with_central_config(false)
        .with_max_spans_per_transaction(2)
        .build();
    let (agent, client) = agent_with_config(config);

    let transaction = agent.start_transaction("busy", "worker");
    for n in 0..3 {
        let span = agent.start_span(format!("op {n}"), "app");
        if n < 2 {
            assert!(span.is_recording());
        } else {
            assert!(!span.is_recording());
            assert!(!span.id().is_valid());
        }
        span.end();
    }
    transaction.end();

    agent.flush(Duration::from_secs(5)).unwrap();
    let lines = &client.intake_payloads()[0];
    // Two real spans plus the transaction; the third span left no record.
    assert_eq!(lines.len(), 4);
    let record = &lines[3]["transaction"];
    assert_eq!(record["span_count"]["started"], 2);
    assert_eq!(record["span_count"]["dropped"], 1);
}

#[test]
fn context_is_injected_and_extractable() {
    let (agent, _client) = test_agent();

    let transaction = agent.start_transaction("outbound", "request");
    let mut headers = HashMap::new();
    agent.inject_context(&mut headers);

    let traceparent = headers.get("traceparent").unwrap();
    assert!(traceparent.starts_with("00-"));
    assert!(traceparent.ends_with("-01"));
    assert_eq!(
        headers.get("elastic-apm-traceparent"),
        headers.get("traceparent")
    );

    let extracted = agent.extract_context(&headers).unwrap();
    assert_eq!(extracted.trace_id, transaction.trace_id());
    assert_eq!(extracted.parent_id, transaction.id());
    assert!(extracted.sampled);

    transaction.end();
}

#[test]
fn span_without_transaction_is_inert_and_silent() {
    let (agent, client) = test_agent();

    let span = agent.start_span("orphan", "app");
    assert!(!span.is_recording());
    span.set_label("ignored", true);
    span.set_outcome(Outcome::Failure);
    span.end();
    span.end();

    agent.flush(Duration::from_secs(5)).unwrap();
    assert!(client.intake_payloads().is_empty());
}

#[test]
fn errors_can_be_captured_without_a_trace() {
    let (agent, client) = test_agent();

    agent.capture_error("config file missing");
    agent.flush(Duration::from_secs(5)).unwrap();

    let error = &client.intake_payloads()[0][1]["error"];
    assert_eq!(error["exception"]["message"], "config file missing");
    assert!(error["trace_id"].is_null());
    assert_eq!(error["id"].as_str().unwrap().len(), 32);
}

#[test]
fn recorded_errors_carry_trace_correlation() {
    let (agent, client) = test_agent();

    let transaction = agent.start_transaction("GET /checkout", "request");
    transaction.record_error("card declined");
    transaction.end();

    agent.flush(Duration::from_secs(5)).unwrap();
    let lines = &client.intake_payloads()[0];
    let error = &lines[1]["error"];
    let record = &lines[2]["transaction"];
    assert_eq!(error["trace_id"], record["trace_id"]);
    assert_eq!(error["transaction_id"], record["id"]);
    assert_eq!(error["culprit"], "GET /checkout");
    assert_eq!(record["outcome"], "failure");
}

#[test]
fn shutdown_drains_and_rejects_further_use() {
    let (agent, client) = test_agent();

    let transaction = agent.start_transaction("last job", "worker");
    transaction.end();

    agent.shutdown().unwrap();
    assert_eq!(client.intake_payloads().len(), 1);

    assert!(matches!(
        agent.shutdown(),
        Err(TransportError::AlreadyShutdown)
    ));
    assert!(matches!(
        agent.flush(Duration::from_secs(1)),
        Err(TransportError::AlreadyShutdown)
    ));
}
