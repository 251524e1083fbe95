//! The crate's error taxonomy.
//!
//! Every fallible public API returns [`Failure`] — a composite of a
//! lifecycle verdict or a leaf error — never a type-erased
//! `Box<dyn std::error::Error>`. This mirrors the common habit of
//! returning concrete `io::Result<T>` rather than boxing errors, generalized
//! to the richer taxonomy the completion engine needs.

use std::fmt;
use std::io;

/// Kinds of failure that are not specific to a single leaf operation.
///
/// These surface instead of (never alongside) a leaf [`Error`] — shutdown in
/// particular must never be reported as a handle or executor error.
#[derive(Debug)]
pub enum Lifecycle {
    /// The completion queue (or handle pool) is shutting down or has
    /// finished shutting down; no further work is accepted.
    ShutdownInProgress,
    /// The event bridge or submission queue has been permanently closed.
    QueueClosed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::ShutdownInProgress => f.write_str("shutdown in progress"),
            Lifecycle::QueueClosed => f.write_str("queue closed"),
        }
    }
}

/// A single leaf error: something concrete went wrong with one operation or
/// one handle.
#[derive(Debug)]
pub enum Error {
    /// The kernel (or platform completion facility) reported an error.
    Kernel {
        /// Raw platform error code (`errno` on Unix, `GetLastError` value on
        /// Windows), if known.
        code: Option<i32>,
        message: String,
    },
    /// The submission was cancelled before it completed successfully.
    Cancellation,
    /// A deadline elapsed before the operation completed.
    Timeout,
    /// The operation record failed validation before being handed to a
    /// backend (e.g. a buffer of the wrong kind for the requested op).
    InvalidSubmission(&'static str),
    /// A bounded queue (waiter queue, submission queue) was at capacity.
    QueueFull,
    /// The backend does not implement this operation kind.
    UnsupportedKind(crate::operation::Kind),
    /// No driver backend is available on this platform/configuration.
    BackendUnavailable,
    /// A [`crate::handle_pool::HandleId`] was not recognized by the pool it
    /// was presented to.
    InvalidHandle,
    /// A [`crate::handle_pool::HandleId`] was minted by a different pool
    /// instance.
    ScopeMismatch,
    /// The handle has already been destroyed.
    HandleClosed,
    /// The handle's bounded waiter queue was full.
    WaitersFull,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Kernel { code, message } => match code {
                Some(code) => write!(f, "kernel error {code}: {message}"),
                None => write!(f, "kernel error: {message}"),
            },
            Error::Cancellation => f.write_str("operation cancelled"),
            Error::Timeout => f.write_str("operation timed out"),
            Error::InvalidSubmission(why) => write!(f, "invalid submission: {why}"),
            Error::QueueFull => f.write_str("queue full"),
            Error::UnsupportedKind(kind) => write!(f, "unsupported operation kind: {kind:?}"),
            Error::BackendUnavailable => f.write_str("no driver backend available"),
            Error::InvalidHandle => f.write_str("invalid handle id"),
            Error::ScopeMismatch => f.write_str("handle id belongs to a different pool"),
            Error::HandleClosed => f.write_str("handle closed"),
            Error::WaitersFull => f.write_str("handle waiter queue full"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Kernel {
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

/// Either a lifecycle verdict, or a leaf error.
#[derive(Debug)]
pub enum Failure {
    /// See [`Lifecycle`].
    Lifecycle(Lifecycle),
    /// See [`Error`].
    Leaf(Error),
}

impl Failure {
    pub(crate) fn shutdown_in_progress() -> Self {
        Failure::Lifecycle(Lifecycle::ShutdownInProgress)
    }

    pub(crate) fn queue_closed() -> Self {
        Failure::Lifecycle(Lifecycle::QueueClosed)
    }

    pub(crate) fn cancellation() -> Self {
        Failure::Leaf(Error::Cancellation)
    }

    /// `true` for the specific cancellation leaf, used by callers that want
    /// to distinguish "cancelled" from every other leaf kind without a full
    /// match.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Failure::Leaf(Error::Cancellation))
    }

    /// `true` when this failure is [`Lifecycle::ShutdownInProgress`].
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Failure::Lifecycle(Lifecycle::ShutdownInProgress))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Lifecycle(l) => fmt::Display::fmt(l, f),
            Failure::Leaf(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for Failure {}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Leaf(err)
    }
}

impl From<io::Error> for Failure {
    fn from(err: io::Error) -> Self {
        Failure::Leaf(Error::from(err))
    }
}
