//! [`CompletionQueue`]: the single-writer actor that accepts submissions,
//! registers waiters, drains completed events, and enforces a
//! resume-exactly-once policy across completion, cancellation and
//! shutdown.
//!
//! There is no language-level actor in Rust. Single-writer isolation over
//! `next_id`/`entries`/`shutdown` is funneled through a `Mutex<Inner>` held
//! only across the bookkeeping step of each call, never across a
//! suspension point or a caller-supplied body — the same substitution
//! `handle_pool::HandlePool` uses for its own actor role.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::buffer::Buffer;
use crate::descriptor::Descriptor;
use crate::error::{Error, Failure};
use crate::operation::{CompletionResult, Event, EventOutcome, Kind, Operation, OperationId};
use crate::queues::{SubmissionQueue, WakeupChannel};
use crate::waiter::Waiter;

type ResumeResult = Result<CompletionResult, Failure>;

struct Entry {
    waiter: Arc<Waiter>,
    // Written at most once, either by `drain` (a real event arrived) or by
    // `shutdown` (the queue is closing out every outstanding entry). Either
    // writer removes the entry from `Inner::entries` under the same lock
    // before writing here, so the two writers can never race on the same
    // id — see `CompletionQueue::drain` and `CompletionQueue::shutdown`.
    result: Arc<Mutex<Option<ResumeResult>>>,
}

struct Inner {
    next_id: u64,
    entries: HashMap<OperationId, Entry>,
    shutdown: bool,
}

impl Inner {
    fn allocate_id(&mut self) -> OperationId {
        let raw = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .expect("OperationId space exhausted: unreachable within any realistic runtime lifetime");
        OperationId::new(raw)
    }
}

/// The completion-queue actor: assigns [`OperationId`]s, registers waiters,
/// drains the [`crate::queues::EventBridge`], and is the sole code that
/// decides how a `{event, waiter state}` pair maps onto a resumption.
pub struct CompletionQueue {
    inner: Mutex<Inner>,
    submission: Arc<SubmissionQueue>,
    wakeup: Arc<dyn WakeupChannel>,
}

impl CompletionQueue {
    /// A fresh queue over the given submission queue and wakeup channel —
    /// normally the pair owned by a [`crate::poll_loop::PollLoop`] running
    /// against the same driver.
    pub fn new(submission: Arc<SubmissionQueue>, wakeup: Arc<dyn WakeupChannel>) -> CompletionQueue {
        CompletionQueue {
            inner: Mutex::new(Inner {
                next_id: 1, // 0 is the reserved sentinel; never assigned.
                entries: HashMap::new(),
                shutdown: false,
            }),
            submission,
            wakeup,
        }
    }

    /// Submit one operation, returning a future that resolves once the
    /// completion queue observes its outcome.
    ///
    /// The returned [`Completion`] must be polled at least once to reach
    /// the kernel — per the waiter module's documented contract, arming
    /// happens synchronously on first poll, before the operation is
    /// pushed onto the submission queue.
    pub fn submit(
        &self,
        kind: Kind,
        descriptor: Descriptor,
        buffer: Option<Box<dyn Buffer>>,
        offset: i64,
    ) -> Completion<'_> {
        Completion {
            queue: self,
            kind,
            descriptor,
            buffer,
            offset,
            phase: Phase::Start,
        }
    }

    /// Request cancellation of the still-outstanding operation `id`.
    ///
    /// Submits a backend `Cancel` operation keyed by `id` (offset carries
    /// the target); does not itself wait for the cancel to land. Idempotent
    /// — cancelling an already-completed or already-cancelled id is not an
    /// error, since the backend's own `ERROR_NOT_FOUND`-equivalent is
    /// swallowed by every backend.
    pub fn cancel(&self, id: OperationId) -> Result<(), Failure> {
        let inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return Err(Failure::shutdown_in_progress());
        }
        drop(inner);
        self.submit_cancel_op(id);
        Ok(())
    }

    fn submit_cancel_op(&self, target: OperationId) {
        let mut inner = self.inner.lock().unwrap();
        let cancel_id = inner.allocate_id();
        drop(inner);
        let op = Operation::new(
            cancel_id,
            Kind::Cancel,
            Descriptor::INVALID,
            None,
            target.as_u64() as i64,
        );
        self.submission.push(op);
        let _ = self.wakeup.wake();
    }

    /// Process one batch of completed events, resuming every caller whose
    /// entry is still live. Called from the actor thread driving the
    /// [`crate::queues::EventBridge`]; never called concurrently with
    /// itself.
    pub fn drain(&self, events: Vec<Event>) {
        for event in events {
            let entry = {
                let mut inner = self.inner.lock().unwrap();
                inner.entries.remove(&event.id)
            };
            let Some(entry) = entry else {
                log::trace!("completion queue: dropping stale event for {}", event.id);
                continue; // Already resolved by shutdown, or a duplicate: stale.
            };
            let Some((waker, was_cancelled)) = entry.waiter.take_for_resume() else {
                // Lost the race to a concurrent resumption (shouldn't
                // normally happen: drain is the only other taker besides
                // shutdown, and shutdown already removed the entry under
                // the same lock before we could have found it above).
                continue;
            };
            let resolved = if was_cancelled {
                Err(Failure::cancellation())
            } else {
                match event.outcome {
                    EventOutcome::Success(success) => Ok(CompletionResult {
                        success,
                        buffer: event.buffer,
                        flags: event.flags,
                    }),
                    EventOutcome::Failure(err) => Err(Failure::Leaf(err)),
                    EventOutcome::Cancellation => Err(Failure::cancellation()),
                }
            };
            *entry.result.lock().unwrap() = Some(resolved);
            waker.wake();
        }
    }

    /// Reject all further submits, drain and resume every outstanding
    /// waiter with `shutdownInProgress`, and mark the queue closed.
    /// Idempotent. Does not itself join the poll thread — see
    /// [`crate::poll_loop::PollLoop::shutdown`] for the full sequence.
    pub fn shutdown(&self) {
        let outstanding = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            std::mem::take(&mut inner.entries)
        };
        for (_id, entry) in outstanding {
            *entry.result.lock().unwrap() = Some(Err(Failure::shutdown_in_progress()));
            if let Some((waker, _was_cancelled)) = entry.waiter.take_for_resume() {
                waker.wake();
            }
        }
        let _ = self.wakeup.wake();
    }

    /// `true` once [`CompletionQueue::shutdown`] has run.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().unwrap().shutdown
    }
}

enum Phase {
    Start,
    Waiting {
        id: OperationId,
        waiter: Arc<Waiter>,
        result: Arc<Mutex<Option<ResumeResult>>>,
    },
    Done,
}

/// The future returned by [`CompletionQueue::submit`].
///
/// Dropping a pending `Completion` flips the waiter's cancellation bit and
/// asks the backend to interrupt the in-flight operation, but never
/// resumes anything itself — there is no one left to resume once the
/// future has been dropped. The backend-side cancel exists so the kernel
/// actually stops doing the work, not to unblock this future.
pub struct Completion<'a> {
    queue: &'a CompletionQueue,
    kind: Kind,
    descriptor: Descriptor,
    buffer: Option<Box<dyn Buffer>>,
    offset: i64,
    phase: Phase,
}

impl<'a> Completion<'a> {
    /// The operation id assigned to this submission, once the future has
    /// been polled at least once. `None` before the first poll and after
    /// the future has resolved — there is nothing left to target by then.
    pub fn id(&self) -> Option<OperationId> {
        match &self.phase {
            Phase::Waiting { id, .. } => Some(*id),
            Phase::Start | Phase::Done => None,
        }
    }
}

impl<'a> Future for Completion<'a> {
    type Output = Result<CompletionResult, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.phase {
            Phase::Start => {
                let mut inner = this.queue.inner.lock().unwrap();
                if inner.shutdown {
                    this.phase = Phase::Done;
                    return Poll::Ready(Err(Failure::shutdown_in_progress()));
                }
                let id = inner.allocate_id();
                let waiter = Arc::new(Waiter::new());
                waiter
                    .arm(cx.waker().clone())
                    .expect("a freshly allocated waiter cannot already be cancelled");
                let result = Arc::new(Mutex::new(None));
                inner.entries.insert(
                    id,
                    Entry {
                        waiter: Arc::clone(&waiter),
                        result: Arc::clone(&result),
                    },
                );
                drop(inner);

                let op = Operation::new(id, this.kind, this.descriptor, this.buffer.take(), this.offset);
                this.queue.submission.push(op);
                let _ = this.queue.wakeup.wake();

                this.phase = Phase::Waiting { id, waiter, result };
                Poll::Pending
            }
            Phase::Waiting { result, .. } => {
                let mut slot = result.lock().unwrap();
                match slot.take() {
                    Some(resolved) => {
                        drop(slot);
                        this.phase = Phase::Done;
                        Poll::Ready(resolved)
                    }
                    None => Poll::Pending,
                }
            }
            Phase::Done => panic!("Completion polled again after completion"),
        }
    }
}

impl<'a> Drop for Completion<'a> {
    fn drop(&mut self) {
        if let Phase::Waiting { id, waiter, .. } = &self.phase {
            waiter.cancel();
            self.queue.submit_cancel_op(*id);
        }
    }
}

/// Out-of-band validation for a submission that can be rejected before any
/// kernel call: an unsupported kind for the target backend's capabilities.
/// Callers that want this check ahead of `submit` (e.g. `channel`) can use
/// it instead of discovering the rejection only via the completion path.
pub fn reject_unless_supported(kind: Kind, supported: &[Kind]) -> Result<(), Failure> {
    if supported.contains(&kind) {
        Ok(())
    } else {
        Err(Error::UnsupportedKind(kind).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Flags, Success};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWake(AtomicUsize);
    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoopWakeupChannel;
    impl WakeupChannel for NoopWakeupChannel {
        fn wake(&self) -> std::io::Result<()> {
            Ok(())
        }
        fn close(&self) {}
    }

    fn dummy_descriptor() -> Descriptor {
        #[cfg(unix)]
        unsafe {
            Descriptor::from_raw_fd(0)
        }
        #[cfg(windows)]
        unsafe {
            Descriptor::from_raw_handle(std::ptr::null_mut())
        }
    }

    fn poll_once<Fut: Future>(fut: Pin<&mut Fut>, waker: &std::task::Waker) -> Poll<Fut::Output> {
        let mut cx = Context::from_waker(waker);
        fut.poll(&mut cx)
    }

    fn new_queue() -> (CompletionQueue, Arc<SubmissionQueue>) {
        let submission = Arc::new(SubmissionQueue::new());
        let queue = CompletionQueue::new(Arc::clone(&submission), Arc::new(NoopWakeupChannel));
        (queue, submission)
    }

    #[test]
    fn submit_then_drain_success_resumes_with_result() {
        let (queue, submission) = new_queue();
        let wake_count = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = std::task::Waker::from(Arc::clone(&wake_count));

        let mut fut = Box::pin(queue.submit(Kind::Read, dummy_descriptor(), None, 0));
        assert!(matches!(poll_once(fut.as_mut(), &waker), Poll::Pending));

        let mut ops = Vec::new();
        submission.drain_into(&mut ops);
        assert_eq!(ops.len(), 1);
        let id = ops[0].id();

        queue.drain(vec![Event {
            id,
            kind: Kind::Read,
            outcome: EventOutcome::Success(Success::Bytes(13)),
            flags: Flags::default(),
            buffer: None,
        }]);
        assert_eq!(wake_count.0.load(Ordering::SeqCst), 1);

        match poll_once(fut.as_mut(), &waker) {
            Poll::Ready(Ok(result)) => assert!(matches!(result.success, Success::Bytes(13))),
            other => panic!("expected a ready success, got {other:?}"),
        }
    }

    #[test]
    fn drop_before_drain_cancels_and_submits_a_cancel_op() {
        let (queue, submission) = new_queue();
        let waker = std::task::Waker::from(Arc::new(CountingWake(AtomicUsize::new(0))));
        {
            let mut fut = Box::pin(queue.submit(Kind::Read, dummy_descriptor(), None, 0));
            assert!(matches!(poll_once(fut.as_mut(), &waker), Poll::Pending));
            // fut drops here, mid-flight.
        }
        let mut ops = Vec::new();
        submission.drain_into(&mut ops);
        // The original read plus the cancel op targeting it.
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].kind(), Kind::Cancel);
    }

    #[test]
    fn shutdown_resolves_outstanding_entries_with_shutdown_in_progress() {
        let (queue, _submission) = new_queue();
        let waker = std::task::Waker::from(Arc::new(CountingWake(AtomicUsize::new(0))));
        let mut fut = Box::pin(queue.submit(Kind::Read, dummy_descriptor(), None, 0));
        assert!(matches!(poll_once(fut.as_mut(), &waker), Poll::Pending));

        queue.shutdown();
        match poll_once(fut.as_mut(), &waker) {
            Poll::Ready(Err(failure)) => assert!(failure.is_shutdown()),
            other => panic!("expected shutdown failure, got {other:?}"),
        }
    }

    #[test]
    fn submit_after_shutdown_fails_immediately() {
        let (queue, _submission) = new_queue();
        queue.shutdown();
        let waker = std::task::Waker::from(Arc::new(CountingWake(AtomicUsize::new(0))));
        let mut fut = Box::pin(queue.submit(Kind::Nop, dummy_descriptor(), None, -1));
        match poll_once(fut.as_mut(), &waker) {
            Poll::Ready(Err(failure)) => assert!(failure.is_shutdown()),
            other => panic!("expected immediate shutdown failure, got {other:?}"),
        }
    }

    #[test]
    fn stale_event_for_an_unknown_id_is_dropped_quietly() {
        let (queue, _submission) = new_queue();
        queue.drain(vec![Event {
            id: OperationId::new(999),
            kind: Kind::Nop,
            outcome: EventOutcome::Success(Success::Completed),
            flags: Flags::default(),
            buffer: None,
        }]);
        // No panic, nothing to assert beyond "it didn't crash" — the entry
        // simply never existed.
    }

    #[test]
    fn ids_are_monotonically_increasing_and_never_zero() {
        let (queue, submission) = new_queue();
        let waker = std::task::Waker::from(Arc::new(CountingWake(AtomicUsize::new(0))));
        let mut futs: Vec<_> = (0..16)
            .map(|_| Box::pin(queue.submit(Kind::Nop, dummy_descriptor(), None, -1)))
            .collect();
        for fut in &mut futs {
            let _ = poll_once(fut.as_mut(), &waker);
        }
        let mut ops = Vec::new();
        submission.drain_into(&mut ops);
        let ids: Vec<u64> = ops.iter().map(|op| op.id().as_u64()).collect();
        assert!(ids.iter().all(|&id| id != 0));
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(ids.iter().collect::<std::collections::HashSet<_>>().len(), ids.len());
    }

    fn _assert_send_sync<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn _completion_queue_is_send_sync() {
        _assert_send_sync::<CompletionQueue>();
    }
}
