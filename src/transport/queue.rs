//! Bounded FIFO of finalized events awaiting transmission.
//!
//! The queue is the only hand-off point between the instrumented
//! application's threads and the sender thread: enqueueing is
//! fire-and-forget and never blocks. When the sender cannot keep up the
//! queue applies its configured [`OverflowPolicy`] instead of growing
//! without bound, and counts what it sheds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::TransportResult;

use super::model::IntakeEvent;

/// What to do with a new event when the queue is at capacity.
///
/// Either way the FIFO order of the surviving events is preserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room for the new one,
    /// preferring fresh data.
    DropOldest,
    /// Reject the new event, preferring already-buffered data. This matches
    /// bounded-channel semantics and is the default.
    DropNewest,
}

/// Requests delivered to the sender thread alongside the event stream.
#[derive(Debug)]
pub(crate) enum Control {
    /// Drain everything buffered and report the result.
    Flush(SyncSender<TransportResult>),
    /// Drain, report, and stop the sender thread.
    Shutdown(SyncSender<TransportResult>),
}

/// One wake-up's worth of work for the sender thread.
#[derive(Debug, Default)]
pub(crate) struct Work {
    pub(crate) events: Vec<IntakeEvent>,
    pub(crate) control: Option<Control>,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<IntakeEvent>,
    control: VecDeque<Control>,
    closed: bool,
}

/// Multi-producer, single-consumer bounded event queue.
#[derive(Debug)]
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        EventQueue {
            state: Mutex::new(QueueState::default()),
            signal: Condvar::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Adds an event, applying the overflow policy at capacity. Never blocks.
    pub(crate) fn enqueue(&self, event: IntakeEvent) {
        let Ok(mut state) = self.state.lock() else {
            self.record_dropped(1);
            return;
        };
        if state.closed {
            drop(state);
            self.record_dropped(1);
            return;
        }
        if state.events.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.events.pop_front();
                    state.events.push_back(event);
                }
                OverflowPolicy::DropNewest => {}
            }
            drop(state);
            self.record_dropped(1);
            if self.dropped.load(Ordering::Relaxed) == 1 {
                tracing::warn!(
                    capacity = self.capacity,
                    policy = ?self.policy,
                    "event queue full, applying overflow policy; further drops are only counted"
                );
            }
            return;
        }
        state.events.push_back(event);
        drop(state);
        self.signal.notify_one();
    }

    /// Submits a control request, waking the sender immediately.
    pub(crate) fn submit(&self, control: Control) -> TransportResult {
        let mut state = self.state.lock()?;
        if let Control::Shutdown(_) = control {
            state.closed = true;
        }
        state.control.push_back(control);
        drop(state);
        self.signal.notify_one();
        Ok(())
    }

    /// Blocks the sender thread until a batch is ready, a control request
    /// arrives, or `wait` elapses. On timeout whatever is buffered (possibly
    /// nothing) is returned so the sender can honor its flush interval.
    pub(crate) fn next_work(&self, wait: Duration, max_batch: usize) -> Work {
        let deadline = Instant::now() + wait;
        let Ok(mut state) = self.state.lock() else {
            return Work::default();
        };
        loop {
            if let Some(control) = state.control.pop_front() {
                // Control drains everything buffered so far.
                return Work {
                    events: state.events.drain(..).collect(),
                    control: Some(control),
                };
            }
            if state.events.len() >= max_batch {
                return Work {
                    events: state.events.drain(..max_batch).collect(),
                    control: None,
                };
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Work {
                    events: state.events.drain(..).collect(),
                    control: None,
                };
            }
            let (guard, _timed_out) = match self.signal.wait_timeout(state, remaining) {
                Ok(res) => res,
                Err(_) => return Work::default(),
            };
            state = guard;
        }
    }

    /// Takes everything currently buffered, without waiting.
    pub(crate) fn take_all(&self) -> Vec<IntakeEvent> {
        self.state
            .lock()
            .map(|mut state| state.events.drain(..).collect())
            .unwrap_or_default()
    }

    pub(crate) fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Number of events shed so far, for observability.
    pub(crate) fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().map(|state| state.events.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::model::{ErrorRecord, Exception};

    fn event(n: u64) -> IntakeEvent {
        IntakeEvent::Error(ErrorRecord {
            id: format!("{n:032x}"),
            trace_id: None,
            transaction_id: None,
            parent_id: None,
            timestamp: n,
            culprit: None,
            exception: Exception {
                message: format!("event {n}"),
                exception_type: None,
            },
        })
    }

    fn timestamps(events: &[IntakeEvent]) -> Vec<u64> {
        events
            .iter()
            .map(|e| match e {
                IntakeEvent::Error(e) => e.timestamp,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn drop_newest_keeps_the_head_of_the_queue() {
        let queue = EventQueue::new(3, OverflowPolicy::DropNewest);
        for n in 0..5 {
            queue.enqueue(event(n));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_events(), 2);
        assert_eq!(timestamps(&queue.take_all()), vec![0, 1, 2]);
    }

    #[test]
    fn drop_oldest_keeps_the_tail_of_the_queue() {
        let queue = EventQueue::new(3, OverflowPolicy::DropOldest);
        for n in 0..5 {
            queue.enqueue(event(n));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_events(), 2);
        assert_eq!(timestamps(&queue.take_all()), vec![2, 3, 4]);
    }

    #[test]
    fn next_work_returns_full_batches_before_the_deadline() {
        let queue = EventQueue::new(16, OverflowPolicy::DropNewest);
        for n in 0..4 {
            queue.enqueue(event(n));
        }
        let work = queue.next_work(Duration::from_secs(30), 4);
        assert_eq!(work.events.len(), 4);
        assert!(work.control.is_none());
    }

    #[test]
    fn next_work_times_out_with_a_partial_batch() {
        let queue = EventQueue::new(16, OverflowPolicy::DropNewest);
        queue.enqueue(event(7));
        let work = queue.next_work(Duration::from_millis(10), 4);
        assert_eq!(timestamps(&work.events), vec![7]);
    }

    #[test]
    fn control_drains_buffered_events() {
        let queue = EventQueue::new(16, OverflowPolicy::DropNewest);
        queue.enqueue(event(1));
        let (tx, _rx) = std::sync::mpsc::sync_channel(1);
        queue.submit(Control::Flush(tx)).unwrap();
        let work = queue.next_work(Duration::from_secs(30), 64);
        assert_eq!(work.events.len(), 1);
        assert!(matches!(work.control, Some(Control::Flush(_))));
    }

    #[test]
    fn enqueue_after_shutdown_is_counted_as_dropped() {
        let queue = EventQueue::new(16, OverflowPolicy::DropNewest);
        let (tx, _rx) = std::sync::mpsc::sync_channel(1);
        queue.submit(Control::Shutdown(tx)).unwrap();
        queue.enqueue(event(1));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.dropped_events(), 1);
    }
}
