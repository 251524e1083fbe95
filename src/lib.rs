//! A cross-platform proactor-style completion I/O engine.
//!
//! This crate unifies three fundamentally different kernel I/O facilities
//! behind one completion abstraction:
//!
//! | Platform | Facility | Module |
//! |---|---|---|
//! | Linux | `io_uring` (falls back to the readiness adapter if the kernel lacks it) | [`driver::io_uring`] |
//! | Windows | I/O completion ports | [`driver::iocp`] |
//! | everywhere else (and Linux without `io_uring`) | `epoll`/`kqueue` readiness, adapted to completion semantics | [`driver::readiness`] |
//!
//! Unlike a **reactor** (the caller is told a descriptor is ready, then
//! performs the I/O itself), this is a **proactor**: the caller submits an
//! intention — "read this many bytes into this buffer" — and is resumed
//! once the kernel (or, on the readiness adapter, the poll thread standing
//! in for it) has actually done the work.
//!
//! # Layout
//!
//! The pieces compose bottom-up:
//!
//! - [`waiter`] — a single-shot, race-free cell pairing a cancellation bit
//!   with a one-shot wakeup latch. The foundation every suspension point in
//!   this crate is built on.
//! - [`waiter_queue`] — a fixed-capacity FIFO of such waiters with O(1)
//!   eager cancellation, used wherever callers contend for one resource.
//! - [`handle_pool`] — an actor-isolated map of application resources,
//!   serializing exclusive access per resource through a [`waiter_queue`].
//! - [`queues`] — the three primitives that connect the poll thread to the
//!   completion actor: a submission queue, an event bridge, and a wakeup
//!   channel.
//! - [`driver`] — the dispatch-table abstraction over the three backends
//!   above, plus [`driver::Capabilities`] each backend declares.
//! - [`poll_loop`] — the dedicated OS thread draining submissions into a
//!   driver and completions back out of it.
//! - [`completion_queue`] — the single-writer actor that assigns operation
//!   IDs, registers waiters, and is the sole code that decides how an event
//!   maps onto a resumption — exactly once, regardless of whether
//!   completion, cancellation, or shutdown wins the race.
//! - [`channel`] — a thin per-descriptor façade over a shared
//!   [`completion_queue::CompletionQueue`].
//! - [`executor`] — a plain owning-thread serial executor, independent of
//!   the poll loop, for host schedulers that want deterministic
//!   serialization of their own continuation work.
//!
//! [`buffer::Buffer`], [`descriptor::Descriptor`], and [`clock::Deadline`]
//! are thin interfaces onto external collaborators (an aligned buffer
//! allocator, per-descriptor wrappers, and monotonic timing) that are
//! explicitly out of scope for this crate to implement.
//!
//! # Example
//!
//! ```no_run
//! use completion_rt::{Config, Runtime};
//! use completion_rt::buffer::OwnedBuffer;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Runtime::new(Config::default())?;
//! let descriptor = unsafe {
//!     # #[cfg(unix)] { completion_rt::descriptor::Descriptor::from_raw_fd(0) }
//!     # #[cfg(windows)] { completion_rt::descriptor::Descriptor::from_raw_handle(std::ptr::null_mut()) }
//! };
//! let channel = runtime.channel(descriptor);
//! let buffer = Box::new(OwnedBuffer::zeroed(4096));
//! // let result = channel.read(buffer, 0)?.await?;
//! # let _ = channel;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod channel;
pub mod clock;
pub mod completion_queue;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod executor;
pub mod handle_pool;
pub mod operation;
pub mod poll_loop;
pub mod queues;
pub mod waiter;
pub mod waiter_queue;

pub(crate) mod macros;

use std::io;
use std::sync::Arc;

pub use channel::Channel;
pub use completion_queue::CompletionQueue;
pub use config::Config;
pub use descriptor::Descriptor;
pub use error::{Error, Failure, Lifecycle};
pub use operation::{CompletionResult, Kind, OperationId};

use poll_loop::PollLoop;
use queues::{EventBridge, SubmissionQueue};

/// Top-level handle wiring a [`driver::Driver`], its [`PollLoop`], and a
/// [`CompletionQueue`] together. This is the constructor embedders are
/// expected to use; `CompletionQueue`/`PollLoop` can still be assembled by
/// hand (see each module's own docs) for embedders that want to own the
/// wiring themselves — the shared-queue global singleton the source
/// describes is deliberately not provided: every `Runtime` is independent
/// and its lifecycle is entirely the caller's.
pub struct Runtime {
    queue: Arc<CompletionQueue>,
    poll_loop: PollLoop,
    drain_thread: Option<std::thread::JoinHandle<()>>,
    capabilities: driver::Capabilities,
}

impl Runtime {
    /// Construct the best backend available for `config`, spawn its poll
    /// thread, and wire up a fresh [`CompletionQueue`] against it.
    pub fn new(config: Config) -> io::Result<Runtime> {
        let driver = driver::create(&config)?;
        let capabilities = driver.capabilities();

        let submission = Arc::new(SubmissionQueue::new());
        let bridge = Arc::new(EventBridge::new());
        let poll_loop = PollLoop::spawn(driver, Arc::clone(&submission), Arc::clone(&bridge));
        let queue = Arc::new(CompletionQueue::new(submission, poll_loop.wakeup()));

        let drain_queue = Arc::clone(&queue);
        let drain_thread = std::thread::Builder::new()
            .name("completion-drain".to_string())
            .spawn(move || {
                while let Some(batch) = bridge.next_batch() {
                    drain_queue.drain(batch);
                }
            })
            .expect("failed to spawn the completion drain thread");

        Ok(Runtime {
            queue,
            poll_loop,
            drain_thread: Some(drain_thread),
            capabilities,
        })
    }

    /// The backend's declared capabilities.
    pub fn capabilities(&self) -> driver::Capabilities {
        self.capabilities
    }

    /// Borrow the shared completion queue directly, for callers who want
    /// [`CompletionQueue::submit`]/[`CompletionQueue::cancel`] without a
    /// [`Channel`] wrapper.
    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    /// Wrap `descriptor` in a [`Channel`] bound to this runtime's queue,
    /// with this runtime's capabilities for early kind rejection.
    pub fn channel(&self, descriptor: Descriptor) -> Channel {
        Channel::new(Arc::clone(&self.queue), descriptor, self.capabilities)
    }

    /// Shut down: reject further submits, resume every outstanding waiter
    /// with `shutdownInProgress`, and join the poll thread and the
    /// completion-drain thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.queue.shutdown();
        // `PollLoop::shutdown` joins the poll thread, whose exit calls
        // `EventBridge::finish`, which is what lets the drain thread's
        // `next_batch` loop observe end-of-stream and return.
        self.poll_loop.shutdown();
        if let Some(handle) = self.drain_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn _runtime_is_send_sync() {
        _assert_send_sync::<Runtime>();
    }
}
