//! The operation/event data model.

use std::fmt;

use crate::buffer::Buffer;
use crate::descriptor::Descriptor;
use crate::error::Error;

/// Unique, monotonically increasing identifier for a submitted operation.
///
/// Zero is reserved as a sentinel and is never assigned. `repr(transparent)`
/// so it costs nothing over a bare `u64` but can't be accidentally mixed
/// with an unrelated `u64` at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct OperationId(u64);

impl OperationId {
    pub(crate) const SENTINEL: OperationId = OperationId(0);

    pub(crate) fn new(raw: u64) -> OperationId {
        debug_assert_ne!(raw, 0, "0 is the reserved sentinel OperationId");
        OperationId(raw)
    }

    /// The raw numeric value, for logging/correlation with platform wire
    /// formats (`user_data` in io_uring, the `Header` payload in IOCP).
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of work an [`Operation`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// No-op; used to exercise the pipeline or as a wakeup carrier on
    /// backends that need an in-band event.
    Nop,
    /// Read from `descriptor` into the operation's buffer.
    Read,
    /// Write the operation's buffer to `descriptor`.
    Write,
    /// Accept a connection on a listening `descriptor`.
    Accept,
    /// Connect `descriptor`, which the caller has already pre-configured
    /// with a peer address.
    Connect,
    /// Send the operation's buffer on a connected `descriptor`.
    Send,
    /// Receive into the operation's buffer from a connected `descriptor`.
    Recv,
    /// Flush `descriptor` to stable storage.
    Fsync,
    /// Close `descriptor`.
    Close,
    /// Cancel another operation, identified by `offset` (overloaded as a
    /// target `OperationId`).
    Cancel,
    /// Interrupt the poll thread; never surfaced to callers as a completion.
    Wakeup,
}

/// A move-only, single-use unit of submitted work.
///
/// `Operation` deliberately has no `Clone`/`Copy` impl: the type system
/// enforces that it can be submitted exactly once, rather than relying on a
/// runtime "taken" bit checked at every access.
pub struct Operation {
    id: OperationId,
    kind: Kind,
    descriptor: Descriptor,
    buffer: Option<Box<dyn Buffer>>,
    offset: i64,
}

impl Operation {
    pub(crate) fn new(
        id: OperationId,
        kind: Kind,
        descriptor: Descriptor,
        buffer: Option<Box<dyn Buffer>>,
        offset: i64,
    ) -> Operation {
        Operation {
            id,
            kind,
            descriptor,
            buffer,
            offset,
        }
    }

    /// This operation's assigned id.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The operation kind.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The descriptor this operation acts on.
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    /// The byte offset (for `Read`/`Write`), or the cancel target id
    /// reinterpreted as `offset as u64` (for `Cancel`). Negative/sentinel
    /// means "unspecified".
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Borrow the payload buffer, if any.
    pub fn buffer(&self) -> Option<&dyn Buffer> {
        self.buffer.as_deref()
    }

    /// Mutably borrow the payload buffer, if any.
    pub fn buffer_mut(&mut self) -> Option<&mut (dyn Buffer + 'static)> {
        self.buffer.as_deref_mut()
    }

    /// Consume the operation, taking ownership of its buffer back out.
    /// Used on the synchronous-failure path: the buffer is returned to the
    /// caller without ever reaching the kernel.
    pub fn into_buffer(self) -> Option<Box<dyn Buffer>> {
        self.buffer
    }

    pub(crate) fn take_buffer(&mut self) -> Option<Box<dyn Buffer>> {
        self.buffer.take()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("has_buffer", &self.buffer.is_some())
            .finish()
    }
}

/// Out-of-band completion flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// io_uring `IORING_CQE_F_MORE`: more completions follow for a
    /// multishot operation.
    pub more: bool,
    /// io_uring `IORING_CQE_F_BUFFER`: the completion selected a buffer
    /// from a registered buffer group.
    pub buffer_select: bool,
    /// The completed transfer was smaller than requested (readiness
    /// adapter synthesizes this on short reads/writes).
    pub short_count: bool,
}

/// The successful result of a completed operation.
#[derive(Debug)]
pub enum Success {
    /// `Read`/`Write`/`Send`/`Recv`: number of bytes transferred.
    Bytes(usize),
    /// `Accept`: the newly accepted descriptor. No peer address is
    /// surfaced.
    Accepted(Descriptor),
    /// `Connect`/`Fsync`/`Close`/`Cancel`/`Nop`: no payload, just
    /// confirmation.
    Completed,
}

/// The three-valued outcome of a backend operation.
#[derive(Debug)]
pub enum Outcome {
    /// The operation completed successfully.
    Success(Success),
    /// The kernel (or backend) reported a failure.
    Failure(Error),
    /// The operation was cancelled before it produced a result.
    Cancellation,
}

/// The full result of a completed operation, handed back to the caller
/// alongside the buffer it submitted (if any).
#[derive(Debug)]
pub struct CompletionResult {
    /// What happened.
    pub success: Success,
    /// The buffer that was submitted with the operation, if any — handed
    /// back exactly once.
    pub buffer: Option<Box<dyn Buffer>>,
    /// Completion flags.
    pub flags: Flags,
}

/// A raw event as delivered by a backend.
///
/// The submitted buffer must stay exclusively owned by whoever actually
/// performs the syscall (the backend, on the poll thread) for the duration
/// of the operation, so it can't also sit parked in the completion queue's
/// own entry map. Instead it rides back from the backend on the `Event`
/// itself and the completion queue reattaches it to the caller's
/// [`CompletionResult`] at drain time: custody changes hands once instead
/// of splitting across two owners.
#[derive(Debug)]
pub struct Event {
    pub id: OperationId,
    pub kind: Kind,
    pub outcome: EventOutcome,
    pub flags: Flags,
    pub buffer: Option<Box<dyn Buffer>>,
}

/// The outcome portion of an [`Event`], before the buffer has been
/// reattached by the completion queue (that reattachment is the actor's
/// job — see `completion_queue::drain`).
#[derive(Debug)]
pub enum EventOutcome {
    Success(Success),
    Failure(Error),
    Cancellation,
}
