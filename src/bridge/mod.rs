//! Bridge from the `tracing` ecosystem onto the trace model.
//!
//! [`ApmLayer`] is a [`tracing_subscriber::Layer`] mapping `tracing` spans
//! to transactions and spans: a root `tracing` span becomes a transaction,
//! a nested one becomes a span under its parent, and closing the `tracing`
//! span ends the entity. Error-level events are captured against the
//! enclosing entity. Applications instrumented with `tracing` get traced
//! without touching the agent API directly.

use tracing_core::span::{Attributes, Id, Record};
use tracing_core::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::agent::Agent;
use crate::trace::{ActiveEntity, ContextStore, LabelValue};

const DEFAULT_TYPE: &str = "custom";

/// The traced entity backing one `tracing` span, stored in the span's
/// extensions so lookups and `on_close` find it from any thread.
struct BridgedEntity(ActiveEntity);

/// `tracing-subscriber` layer forwarding spans and error events to an
/// [`Agent`].
pub struct ApmLayer {
    agent: Agent,
}

impl std::fmt::Debug for ApmLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApmLayer").field("agent", &self.agent).finish()
    }
}

impl ApmLayer {
    pub(crate) fn new(agent: Agent) -> Self {
        ApmLayer { agent }
    }

    /// The entity a new span should be parented under: the enclosing
    /// `tracing` span's entity when there is one, otherwise whatever is
    /// active on the current context (e.g. a transaction started through
    /// the agent API directly).
    fn parent_entity<S>(&self, attrs: &Attributes<'_>, ctx: &Context<'_, S>) -> Option<ActiveEntity>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let parent = if let Some(parent_id) = attrs.parent() {
            ctx.span(parent_id)
        } else if attrs.is_contextual() {
            ctx.lookup_current()
        } else {
            None
        };
        match parent {
            Some(span) => span
                .extensions()
                .get::<BridgedEntity>()
                .map(|bridged| bridged.0.clone()),
            None => ContextStore::active(),
        }
    }
}

impl<S> Layer<S> for ApmLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let name = attrs.metadata().name();
        let entity: ActiveEntity = match self.parent_entity(attrs, &ctx) {
            Some(parent) => self
                .agent
                .start_span_with_parent(name, DEFAULT_TYPE, &parent)
                .into(),
            None => self.agent.start_transaction(name, DEFAULT_TYPE).into(),
        };

        let mut visitor = LabelVisitor { entity: &entity };
        attrs.record(&mut visitor);

        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(BridgedEntity(entity));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(bridged) = span.extensions().get::<BridgedEntity>() {
                let mut visitor = LabelVisitor { entity: &bridged.0 };
                values.record(&mut visitor);
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if event.metadata().level() != &Level::ERROR {
            return;
        }
        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);
        let message = visitor
            .message
            .unwrap_or_else(|| event.metadata().name().to_owned());

        let entity = ctx
            .event_span(event)
            .and_then(|span| {
                span.extensions()
                    .get::<BridgedEntity>()
                    .map(|bridged| bridged.0.clone())
            })
            .or_else(ContextStore::active);
        match entity {
            Some(entity) => entity.record_error(message),
            None => self.agent.capture_error(message),
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(&id) {
            if let Some(bridged) = span.extensions_mut().remove::<BridgedEntity>() {
                bridged.0.end();
            }
        }
    }
}

/// Records span fields as labels.
struct LabelVisitor<'a> {
    entity: &'a ActiveEntity,
}

impl tracing_core::field::Visit for LabelVisitor<'_> {
    fn record_str(&mut self, field: &tracing_core::field::Field, value: &str) {
        self.entity.set_label(field.name(), value);
    }

    fn record_bool(&mut self, field: &tracing_core::field::Field, value: bool) {
        self.entity.set_label(field.name(), value);
    }

    fn record_i64(&mut self, field: &tracing_core::field::Field, value: i64) {
        self.entity.set_label(field.name(), value);
    }

    fn record_u64(&mut self, field: &tracing_core::field::Field, value: u64) {
        self.entity.set_label(field.name(), value as f64);
    }

    fn record_f64(&mut self, field: &tracing_core::field::Field, value: f64) {
        self.entity.set_label(field.name(), value);
    }

    fn record_debug(&mut self, field: &tracing_core::field::Field, value: &dyn std::fmt::Debug) {
        self.entity
            .set_label(field.name(), LabelValue::String(format!("{value:?}")));
    }
}

/// Extracts the `message` field from an error event.
struct MessageVisitor {
    message: Option<String>,
}

impl tracing_core::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing_core::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_owned());
        }
    }

    fn record_error(
        &mut self,
        field: &tracing_core::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &tracing_core::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_subscriber::layer::SubscriberExt;

    use crate::testing::test_agent;

    #[test]
    fn root_span_becomes_a_transaction() {
        let (agent, client) = test_agent();
        let subscriber = tracing_subscriber::registry().with(agent.tracing_layer());

        tracing::subscriber::with_default(subscriber, || {
            let root = tracing::info_span!("handle request", peer = "10.0.0.1");
            let _enter = root.entered();
        });

        agent.flush(Duration::from_secs(5)).unwrap();
        let payloads = client.intake_payloads();
        assert_eq!(payloads.len(), 1);
        let transaction = &payloads[0][1]["transaction"];
        assert_eq!(transaction["name"], "handle request");
        assert_eq!(transaction["type"], "custom");
        assert_eq!(transaction["context"]["tags"]["peer"], "10.0.0.1");
    }

    #[test]
    fn nested_span_becomes_a_child_span() {
        let (agent, client) = test_agent();
        let subscriber = tracing_subscriber::registry().with(agent.tracing_layer());

        tracing::subscriber::with_default(subscriber, || {
            let root = tracing::info_span!("parent work");
            let _enter = root.entered();
            let child = tracing::info_span!("child work");
            let _child = child.entered();
        });

        agent.flush(Duration::from_secs(5)).unwrap();
        let lines = &client.intake_payloads()[0];
        // Child closes first, so: metadata, span, transaction.
        let span = &lines[1]["span"];
        let transaction = &lines[2]["transaction"];
        assert_eq!(span["name"], "child work");
        assert_eq!(span["trace_id"], transaction["trace_id"]);
        assert_eq!(span["parent_id"], transaction["id"]);
    }

    #[test]
    fn error_events_mark_the_enclosing_entity() {
        let (agent, client) = test_agent();
        let subscriber = tracing_subscriber::registry().with(agent.tracing_layer());

        tracing::subscriber::with_default(subscriber, || {
            let root = tracing::info_span!("failing work");
            let _enter = root.entered();
            tracing::error!("payment provider unreachable");
        });

        agent.flush(Duration::from_secs(5)).unwrap();
        let lines = &client.intake_payloads()[0];
        let error = &lines[1]["error"];
        assert_eq!(error["exception"]["message"], "payment provider unreachable");
        let transaction = &lines[2]["transaction"];
        assert_eq!(transaction["outcome"], "failure");
        assert_eq!(error["trace_id"], transaction["trace_id"]);
    }
}
