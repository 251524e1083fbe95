//! Submission queue: a plain mutex-guarded deque. Many actor calls push
//! operation records; one poll-thread iteration drains all of them at once.
//! `mio`'s own internals favor the simplest lock that amortizes over a
//! batch rather than a lock-free MPSC for this exact shape, and submission
//! volume here is bounded by how fast callers can call `submit`, not by the
//! poll loop — a `Mutex<VecDeque<_>>` is the right tool.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::operation::Operation;

/// Thread-safe MPSC buffer of pending [`Operation`] records.
pub struct SubmissionQueue {
    inner: Mutex<VecDeque<Operation>>,
}

impl SubmissionQueue {
    pub fn new() -> SubmissionQueue {
        SubmissionQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Push one record. Called from any number of submitting contexts.
    pub fn push(&self, op: Operation) {
        self.inner.lock().unwrap().push_back(op);
    }

    /// Append every pending record into `buf` and clear the queue. Called
    /// once per poll-loop iteration, from the single poll thread.
    pub fn drain_into(&self, buf: &mut Vec<Operation>) -> usize {
        let mut guard = self.inner.lock().unwrap();
        let count = guard.len();
        buf.extend(guard.drain(..));
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubmissionQueue {
    fn default() -> SubmissionQueue {
        SubmissionQueue::new()
    }
}
