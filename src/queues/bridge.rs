//! Event bridge: single-producer (poll thread), single-consumer
//! (completion-queue actor thread) channel of completed [`Event`] batches.
//!
//! Built on a plain `Mutex` + `Condvar`, per spec's own "internal mutex +
//! condvar or equivalent" — there's exactly one waiter and one signaler, so
//! a full MPMC channel crate would be pure overhead.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::operation::Event;

struct State {
    events: VecDeque<Event>,
    finished: bool,
}

/// SPSC bridge carrying completed [`Event`]s from the poll thread to
/// whichever thread drives [`crate::completion_queue::CompletionQueue::drain`].
pub struct EventBridge {
    state: Mutex<State>,
    ready: Condvar,
}

impl EventBridge {
    pub fn new() -> EventBridge {
        EventBridge {
            state: Mutex::new(State {
                events: VecDeque::new(),
                finished: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Push one completed batch. Non-blocking; wakes a consumer parked in
    /// [`EventBridge::next_batch`].
    pub fn push(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.events.extend(batch);
        self.ready.notify_one();
    }

    /// Block until at least one event is available, returning every event
    /// queued so far as one batch. Returns `None` once the bridge has
    /// finished and drained empty — end-of-stream.
    pub fn next_batch(&self) -> Option<Vec<Event>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.events.is_empty() {
                return Some(state.events.drain(..).collect());
            }
            if state.finished {
                return None;
            }
            state = self.ready.wait(state).unwrap();
        }
    }

    /// Signal end-of-stream: any consumer blocked in `next_batch` wakes with
    /// `None` once the currently queued events (if any) have been drained.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        self.ready.notify_one();
    }
}

impl Default for EventBridge {
    fn default() -> EventBridge {
        EventBridge::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{EventOutcome, Flags, Kind, OperationId, Success};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn dummy_event(n: u64) -> Event {
        Event {
            id: OperationId::new(n),
            kind: Kind::Nop,
            outcome: EventOutcome::Success(Success::Completed),
            flags: Flags::default(),
            buffer: None,
        }
    }

    #[test]
    fn push_then_next_batch_returns_in_order() {
        let bridge = EventBridge::new();
        bridge.push(vec![dummy_event(1), dummy_event(2)]);
        let batch = bridge.next_batch().unwrap();
        assert_eq!(
            batch.iter().map(|e| e.id.as_u64()).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn finish_with_empty_queue_yields_end_of_stream() {
        let bridge = EventBridge::new();
        bridge.finish();
        assert!(bridge.next_batch().is_none());
    }

    #[test]
    fn consumer_blocks_until_producer_pushes() {
        let bridge = Arc::new(EventBridge::new());
        let consumer = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.next_batch())
        };
        thread::sleep(Duration::from_millis(20));
        bridge.push(vec![dummy_event(7)]);
        let batch = consumer.join().unwrap().unwrap();
        assert_eq!(batch[0].id.as_u64(), 7);
    }
}
