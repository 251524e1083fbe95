//! [`Channel`]: a thin per-descriptor façade over a shared
//! [`CompletionQueue`], offering `read`/`write`/`accept`/`connect`/`close`
//! without requiring every caller to spell out `submit(Kind::..., ...)`.
//!
//! Carries no state of its own beyond the [`Descriptor`] it wraps and a
//! reference to the engine — exactly as `mio`'s own `net` wrappers are thin
//! shells over a raw fd/socket plus a reference to the `Registry`.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::completion_queue::{reject_unless_supported, Completion, CompletionQueue};
use crate::descriptor::Descriptor;
use crate::driver::Capabilities;
use crate::error::Failure;
use crate::operation::{Kind, OperationId};

/// A descriptor bound to a [`CompletionQueue`], exposing the handful of
/// operations the engine supports as ordinary async methods.
///
/// `Channel` does not own `descriptor` — per [`Descriptor`]'s own contract,
/// the caller who opened the underlying fd/`HANDLE` must keep it alive and
/// is responsible for the final `close` (which this type can still submit,
/// but does not imply ownership transfer).
#[derive(Clone)]
pub struct Channel {
    queue: Arc<CompletionQueue>,
    descriptor: Descriptor,
    capabilities: Capabilities,
}

impl Channel {
    /// Wrap `descriptor` for submissions against `queue`. `capabilities`
    /// (typically the same value as `driver.capabilities()`) lets `Channel`
    /// reject an unsupported operation kind before it ever reaches the
    /// submission queue, rather than discovering the rejection only via the
    /// completion path.
    pub fn new(queue: Arc<CompletionQueue>, descriptor: Descriptor, capabilities: Capabilities) -> Channel {
        Channel {
            queue,
            descriptor,
            capabilities,
        }
    }

    /// The wrapped descriptor.
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn submit(&self, kind: Kind, buffer: Option<Box<dyn Buffer>>, offset: i64) -> Result<Completion<'_>, Failure> {
        reject_unless_supported(kind, self.capabilities.supported)?;
        Ok(self.queue.submit(kind, self.descriptor, buffer, offset))
    }

    /// Read into `buffer`, starting at `offset` (negative means "current
    /// position", for descriptors where that's meaningful).
    pub fn read(&self, buffer: Box<dyn Buffer>, offset: i64) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Read, Some(buffer), offset)
    }

    /// Write `buffer`, starting at `offset`.
    pub fn write(&self, buffer: Box<dyn Buffer>, offset: i64) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Write, Some(buffer), offset)
    }

    /// Send `buffer` on a connected descriptor.
    pub fn send(&self, buffer: Box<dyn Buffer>) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Send, Some(buffer), -1)
    }

    /// Receive into `buffer` from a connected descriptor.
    pub fn recv(&self, buffer: Box<dyn Buffer>) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Recv, Some(buffer), -1)
    }

    /// Accept a connection on this (listening) descriptor.
    pub fn accept(&self) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Accept, None, -1)
    }

    /// Complete an already-issued connect on this descriptor (the caller
    /// has pre-configured the peer address out of band; see
    /// [`crate::operation::Kind::Connect`]).
    pub fn connect(&self) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Connect, None, -1)
    }

    /// Flush this descriptor to stable storage.
    pub fn fsync(&self) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Fsync, None, -1)
    }

    /// Close this descriptor through the engine rather than a direct
    /// syscall, so the close itself observes the same completion path as
    /// every other operation.
    pub fn close(&self) -> Result<Completion<'_>, Failure> {
        self.submit(Kind::Close, None, -1)
    }

    /// Request cancellation of a still-outstanding operation on this
    /// channel's queue.
    pub fn cancel(&self, id: OperationId) -> Result<(), Failure> {
        self.queue.cancel(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::{SubmissionQueue, WakeupChannel};
    use std::io;

    struct NoopWakeupChannel;
    impl WakeupChannel for NoopWakeupChannel {
        fn wake(&self) -> io::Result<()> {
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

    fn full_capabilities() -> Capabilities {
        Capabilities {
            max_submissions: 16,
            max_completions: 16,
            batched_submission: false,
            registered_buffers: false,
            multishot: true,
            supported: crate::driver::ALL_KINDS,
        }
    }

    fn new_channel(capabilities: Capabilities) -> (Channel, Arc<SubmissionQueue>) {
        let submission = Arc::new(SubmissionQueue::new());
        let queue = Arc::new(CompletionQueue::new(Arc::clone(&submission), Arc::new(NoopWakeupChannel)));
        (Channel::new(queue, dummy_descriptor(), capabilities), submission)
    }

    #[test]
    fn fsync_on_a_fully_capable_backend_submits_one_operation() {
        let (channel, submission) = new_channel(full_capabilities());
        let fut = channel.fsync().unwrap();
        drop(fut); // dropping a freshly-constructed, unpolled future is a no-op.
        assert!(submission.is_empty());
    }

    #[test]
    fn unsupported_kind_is_rejected_before_it_reaches_the_submission_queue() {
        let restricted = Capabilities {
            max_submissions: 16,
            max_completions: 16,
            batched_submission: false,
            registered_buffers: false,
            multishot: false,
            supported: &[Kind::Read],
        };
        let (channel, submission) = new_channel(restricted);
        let err = channel.fsync().unwrap_err();
        assert!(!err.is_shutdown() && !err.is_cancellation());
        assert!(submission.is_empty());
    }
}
