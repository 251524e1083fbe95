//! [`PollLoop`]: the dedicated thread that owns a `Box<dyn Driver>` and
//! turns submitted [`crate::operation::Operation`]s into completed
//! [`crate::operation::Event`]s.
//!
//! One iteration: drain [`SubmissionQueue`], hand every operation to the
//! driver (collecting any synchronous-failure events it returns directly),
//! `flush()` whatever got batched, then block in `poll()` until something is
//! ready or the driver's own wakeup channel is pinged. Non-empty completion
//! batches go to the [`EventBridge`]; shutdown is a flag checked once per
//! iteration, with `poll()` itself bounded by [`SHUTDOWN_POLL_INTERVAL`] so
//! a loop with nothing in flight still notices shutdown promptly even if a
//! wakeup is somehow missed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::Deadline;
use crate::driver::Driver;
use crate::queues::{EventBridge, SubmissionQueue, WakeupChannel};

/// How long a single `poll()` call is allowed to block before the loop
/// rechecks the shutdown flag, absent any operation-driven deadline. Short
/// enough that a wakeup failure (unlikely, but not impossible) still leaves
/// shutdown bounded.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Owns the poll thread for one driver instance.
///
/// Constructed once per [`crate::completion_queue::CompletionQueue`]; the
/// two are meant to be built together by whatever top-level constructor
/// wires up a runtime (see [`crate::channel`]).
pub struct PollLoop {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wakeup: Arc<dyn WakeupChannel>,
}

impl PollLoop {
    /// Spawn the poll thread. `driver` is moved onto it; `submission` and
    /// `bridge` are the shared queues the thread drains from and pushes
    /// into respectively.
    pub fn spawn(
        driver: Box<dyn Driver>,
        submission: Arc<SubmissionQueue>,
        bridge: Arc<EventBridge>,
    ) -> PollLoop {
        let wakeup = driver.wakeup();
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("completion-poll".to_string())
            .spawn(move || run(driver, &submission, &bridge, &thread_shutdown))
            .expect("failed to spawn the completion poll thread");

        PollLoop {
            handle: Some(handle),
            shutdown,
            wakeup,
        }
    }

    /// This loop's wakeup channel, shared with the [`crate::completion_queue::CompletionQueue`]
    /// that submits against the same driver.
    pub fn wakeup(&self) -> Arc<dyn WakeupChannel> {
        Arc::clone(&self.wakeup)
    }

    /// Signal the poll thread to stop, wake it if it's blocked in `poll()`,
    /// and join it. Idempotent; safe to call more than once.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wakeup.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut driver: Box<dyn Driver>,
    submission: &SubmissionQueue,
    bridge: &EventBridge,
    shutdown: &AtomicBool,
) {
    let mut pending = Vec::new();
    let mut events = Vec::new();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        pending.clear();
        submission.drain_into(&mut pending);
        for op in pending.drain(..) {
            events.extend(driver.submit(op));
        }
        if let Err(err) = driver.flush() {
            log::warn!("poll loop: flush failed: {err}");
        }
        if !events.is_empty() {
            bridge.push(std::mem::take(&mut events));
        }

        let deadline = Deadline::after(SHUTDOWN_POLL_INTERVAL);
        match driver.poll(Some(deadline.remaining()), &mut events) {
            Ok(_) => {}
            Err(err) => log::warn!("poll loop: poll failed: {err}"),
        }
        if !events.is_empty() {
            bridge.push(std::mem::take(&mut events));
        }
    }

    // Drain whatever the driver already had queued up before handing back
    // its platform resources, so nothing submitted just before shutdown is
    // silently lost.
    pending.clear();
    submission.drain_into(&mut pending);
    for op in pending.drain(..) {
        events.extend(driver.submit(op));
    }
    let _ = driver.flush();
    if !events.is_empty() {
        bridge.push(std::mem::take(&mut events));
    }
    bridge.finish();

    // Release the backend's platform resources (file descriptors, the
    // IOCP handle, any still-registered `Header` allocations) before the
    // thread exits — plain drop glue on `Box<dyn Driver>` does not call
    // this.
    driver.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::driver::Capabilities;
    use crate::operation::{Event, EventOutcome, Flags, Kind, Operation, OperationId, Success};
    use std::sync::Mutex;

    struct NoopWakeup;
    impl WakeupChannel for NoopWakeup {
        fn wake(&self) -> io::Result<()> {
            Ok(())
        }
        fn close(&self) {}
    }

    /// A driver stub that completes every submitted `Nop` immediately and
    /// never blocks in `poll`, so tests can run the real loop body without a
    /// platform backend.
    struct StubDriver {
        ready: Mutex<Vec<Event>>,
    }

    impl Driver for StubDriver {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                max_submissions: 16,
                max_completions: 16,
                batched_submission: false,
                registered_buffers: false,
                multishot: false,
                supported: crate::driver::ALL_KINDS,
            }
        }

        fn submit(&mut self, op: Operation) -> Vec<Event> {
            vec![Event {
                id: op.id(),
                kind: op.kind(),
                outcome: EventOutcome::Success(Success::Completed),
                flags: Flags::default(),
                buffer: op.into_buffer(),
            }]
        }

        fn flush(&mut self) -> io::Result<usize> {
            Ok(0)
        }

        fn poll(&mut self, _deadline: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
            let mut ready = self.ready.lock().unwrap();
            let n = ready.len();
            out.append(&mut ready);
            std::thread::sleep(Duration::from_millis(5));
            Ok(n)
        }

        fn wakeup(&self) -> Arc<dyn WakeupChannel> {
            Arc::new(NoopWakeup)
        }

        fn close(self: Box<Self>) {}
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

    #[test]
    fn submitted_op_surfaces_as_a_completed_event() {
        let driver: Box<dyn Driver> = Box::new(StubDriver {
            ready: Mutex::new(Vec::new()),
        });
        let submission = Arc::new(SubmissionQueue::new());
        let bridge = Arc::new(EventBridge::new());

        submission.push(Operation::new(OperationId::new(1), Kind::Nop, dummy_descriptor(), None, -1));

        let mut loop_ = PollLoop::spawn(driver, Arc::clone(&submission), Arc::clone(&bridge));
        let batch = bridge.next_batch().expect("expected a completion batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id.as_u64(), 1);

        loop_.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_joins_cleanly() {
        let driver: Box<dyn Driver> = Box::new(StubDriver {
            ready: Mutex::new(Vec::new()),
        });
        let submission = Arc::new(SubmissionQueue::new());
        let bridge = Arc::new(EventBridge::new());
        let mut loop_ = PollLoop::spawn(driver, submission, bridge);
        loop_.shutdown();
        loop_.shutdown();
    }
}
