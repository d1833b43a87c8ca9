//! Per-execution-context tracking of the currently active entity.
//!
//! Each thread (or logical unit of work pinned to a thread at a given
//! moment) has its own stack of active entities. Starting a transaction or
//! span pushes it onto the stack of the starting context; ending it restores
//! the previous active entity. Entities are cheaply clonable handles, so
//! crossing a task or thread boundary is done either by passing the handle
//! explicitly or by re-activating it on the new context with [`ContextStore::attach`],
//! whose guard restores the prior state on drop.

use std::cell::RefCell;

use super::{Span, SpanId, TraceId, Transaction};

thread_local! {
    static ACTIVE_STACK: RefCell<Vec<ActiveEntity>> = const { RefCell::new(Vec::new()) };
}

/// A handle to either kind of traced entity.
///
/// The variant is chosen by the call pattern ("is there a currently active
/// entity"), never by the caller guessing, so bridged instrumentation does
/// not need to know about transactions versus spans.
#[derive(Clone, Debug)]
pub enum ActiveEntity {
    /// A root unit of work.
    Transaction(Transaction),
    /// A child unit of work.
    Span(Span),
}

impl ActiveEntity {
    /// The trace this entity belongs to.
    pub fn trace_id(&self) -> TraceId {
        match self {
            ActiveEntity::Transaction(t) => t.trace_id(),
            ActiveEntity::Span(s) => s.trace_id(),
        }
    }

    /// The entity's own id.
    pub fn id(&self) -> SpanId {
        match self {
            ActiveEntity::Transaction(t) => t.id(),
            ActiveEntity::Span(s) => s.id(),
        }
    }

    /// Id of the transaction that owns this entity.
    pub fn transaction_id(&self) -> SpanId {
        match self {
            ActiveEntity::Transaction(t) => t.id(),
            ActiveEntity::Span(s) => s.transaction_id(),
        }
    }

    /// Whether the owning trace was sampled.
    pub fn is_sampled(&self) -> bool {
        match self {
            ActiveEntity::Transaction(t) => t.is_sampled(),
            ActiveEntity::Span(s) => s.is_sampled(),
        }
    }

    /// Whether the underlying entity has not been ended yet.
    pub fn is_recording(&self) -> bool {
        match self {
            ActiveEntity::Transaction(t) => t.is_recording(),
            ActiveEntity::Span(s) => s.is_recording(),
        }
    }

    /// Ends the underlying entity.
    pub fn end(&self) {
        match self {
            ActiveEntity::Transaction(t) => t.end(),
            ActiveEntity::Span(s) => s.end(),
        }
    }

    /// Sets a label on the underlying entity.
    pub fn set_label(&self, key: impl Into<String>, value: impl Into<super::LabelValue>) {
        match self {
            ActiveEntity::Transaction(t) => t.set_label(key, value),
            ActiveEntity::Span(s) => s.set_label(key, value),
        }
    }

    /// Records an error against the underlying entity.
    pub fn record_error(&self, message: impl std::fmt::Display) {
        match self {
            ActiveEntity::Transaction(t) => t.record_error(message),
            ActiveEntity::Span(s) => s.record_error(message),
        }
    }
}

impl From<Transaction> for ActiveEntity {
    fn from(transaction: Transaction) -> Self {
        ActiveEntity::Transaction(transaction)
    }
}

impl From<Span> for ActiveEntity {
    fn from(span: Span) -> Self {
        ActiveEntity::Span(span)
    }
}

/// Access to the calling context's active-entity stack.
#[derive(Debug)]
pub struct ContextStore {
    _private: (),
}

impl ContextStore {
    /// Returns the currently active entity of the calling context, if any.
    ///
    /// Entities ended on another thread leave their entry on the starting
    /// thread's stack; reads prune those, so an ended entity is never
    /// observed as active.
    pub fn active() -> Option<ActiveEntity> {
        ACTIVE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.retain(ActiveEntity::is_recording);
            stack.last().cloned()
        })
    }

    /// Returns the transaction owning the currently active entity, walking
    /// down the stack if the top is a span.
    pub fn active_transaction() -> Option<Transaction> {
        ACTIVE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.retain(ActiveEntity::is_recording);
            stack.iter().rev().find_map(|entity| match entity {
                ActiveEntity::Transaction(t) => Some(t.clone()),
                ActiveEntity::Span(_) => None,
            })
        })
    }

    /// Makes `entity` the active entity of the calling context until the
    /// returned guard is dropped, at which point the previous state is
    /// restored. This is the hand-off point when a unit of work resumes on
    /// another thread or task.
    pub fn attach(entity: ActiveEntity) -> ActivationGuard {
        let id = entity.id();
        ACTIVE_STACK.with(|stack| stack.borrow_mut().push(entity));
        ActivationGuard::new(id)
    }

    /// Clears the calling context's stack entirely.
    pub fn clear() {
        ACTIVE_STACK.with(|stack| stack.borrow_mut().clear());
    }

    pub(crate) fn push(entity: ActiveEntity) {
        ACTIVE_STACK.with(|stack| stack.borrow_mut().push(entity));
    }

    /// Removes the topmost stack entry with the given id, restoring whatever
    /// was below it. Ending out of order therefore never pops someone else's
    /// entity.
    pub(crate) fn remove(id: SpanId) {
        ACTIVE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|entity| entity.id() == id) {
                stack.remove(pos);
            }
        });
    }
}

/// Restores the previously active entity when dropped.
///
/// Guards must be dropped on the thread that created them; they deliberately
/// do not implement `Send`.
#[derive(Debug)]
pub struct ActivationGuard {
    id: SpanId,
    // ensure this type is !Send and !Sync
    _marker: std::marker::PhantomData<*const ()>,
}

impl ActivationGuard {
    fn new(id: SpanId) -> Self {
        ActivationGuard {
            id,
            _marker: std::marker::PhantomData,
        }
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        ContextStore::remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_agent;

    #[test]
    fn activation_nests_and_restores() {
        let (agent, _) = test_agent();
        assert!(ContextStore::active().is_none());

        let transaction = agent.start_transaction("outer", "test");
        assert_eq!(ContextStore::active().map(|e| e.id()), Some(transaction.id()));

        let span = agent.start_span("inner", "test");
        assert_eq!(ContextStore::active().map(|e| e.id()), Some(span.id()));
        assert_eq!(
            ContextStore::active_transaction().map(|t| t.id()),
            Some(transaction.id())
        );

        span.end();
        assert_eq!(ContextStore::active().map(|e| e.id()), Some(transaction.id()));

        transaction.end();
        assert!(ContextStore::active().is_none());
    }

    #[test]
    fn attach_guard_restores_previous_state() {
        let (agent, _) = test_agent();
        let transaction = agent.start_transaction("tx", "test");
        let handle: ActiveEntity = transaction.clone().into();
        ContextStore::clear();
        assert!(ContextStore::active().is_none());

        {
            let _guard = ContextStore::attach(handle);
            assert_eq!(ContextStore::active().map(|e| e.id()), Some(transaction.id()));
        }
        assert!(ContextStore::active().is_none());
        transaction.end();
    }

    #[test]
    fn ending_on_another_thread_clears_the_starting_stack() {
        let (agent, _) = test_agent();
        let transaction = agent.start_transaction("handoff", "worker");
        let handle = transaction.clone();
        std::thread::spawn(move || handle.end()).join().unwrap();

        // The starting thread's stack entry is pruned on the next read, so
        // new work no longer parents under the ended transaction.
        assert!(ContextStore::active().is_none());
        assert!(ContextStore::active_transaction().is_none());
        let span = agent.start_span("orphan", "test");
        assert!(!span.is_recording());
    }

    #[test]
    fn out_of_order_end_does_not_pop_siblings() {
        let (agent, _) = test_agent();
        let transaction = agent.start_transaction("tx", "test");
        let first = agent.start_span("first", "test");
        let second = agent.start_span("second", "test");

        // Ending the outer span first must leave the inner one active.
        first.end();
        assert_eq!(ContextStore::active().map(|e| e.id()), Some(second.id()));

        second.end();
        transaction.end();
        assert!(ContextStore::active().is_none());
    }
}
