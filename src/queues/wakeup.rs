//! Wakeup channel: the platform primitive used to interrupt the poll
//! thread's blocking wait. `wake()` must be idempotent and safe to call
//! from any thread; concurrent wakes may coalesce into a single wakeup, but
//! at least one must be delivered per call.
//!
//! Concrete implementations live next to the backend that needs them:
//! `sys::unix::EventFdWakeup` (Linux eventfd, shared by the io_uring and
//! epoll backends), `sys::unix::UserEventWakeup` (kqueue `EVFILT_USER`), and
//! `sys::windows::IocpWakeup` (`PostQueuedCompletionStatus` with a null
//! overlapped pointer).

use std::io;

/// A thread-safe primitive to interrupt the poll thread's blocking wait.
pub trait WakeupChannel: Send + Sync {
    /// Request a wakeup. Idempotent; safe from any thread.
    fn wake(&self) -> io::Result<()>;

    /// Release the underlying platform resource. Called once, when the
    /// driver handle that owns this channel is consumed.
    fn close(&self);
}
