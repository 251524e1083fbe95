//! The readiness-based backend: epoll on Linux/Android, kqueue on the BSDs
//! and macOS. This is the fallback every platform has, and the only
//! backend [`crate::config::DriverChoice::Readiness`] can force.
//!
//! Unlike `io_uring`/IOCP, a readiness facility only ever tells us "this
//! descriptor is now readable/writable" — it never performs the I/O itself.
//! [`ReadinessDriver`] bridges that gap the way `mio`'s own users are
//! expected to: try the syscall once, and if it would block, park the
//! operation behind a registration until the selector says try again.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll::Selector;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
use kqueue::Selector;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::config::Config;
use crate::descriptor::Descriptor;
use crate::error::Error;
use crate::operation::{Event, EventOutcome, Flags, Kind, Operation, OperationId, Success};
use crate::queues::WakeupChannel;

use super::{Capabilities, Driver};

/// Which readiness edges an in-flight operation is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Interest {
    pub(super) readable: bool,
    pub(super) writable: bool,
}

impl Interest {
    pub(super) const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub(super) const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };
}

/// Token the selector reserves for its own wakeup registration. `0` is also
/// [`OperationId`]'s reserved sentinel, so it can never collide with a real
/// operation's token.
pub(super) const WAKEUP_TOKEN: u64 = 0;

const SUPPORTED_KINDS: &[Kind] = &[
    Kind::Nop,
    Kind::Read,
    Kind::Write,
    Kind::Accept,
    Kind::Connect,
    Kind::Send,
    Kind::Recv,
    Kind::Fsync,
    Kind::Close,
    Kind::Cancel,
];

struct PendingOp {
    kind: Kind,
    descriptor: Descriptor,
    buffer: Option<Box<dyn Buffer>>,
}

/// The epoll/kqueue-backed [`Driver`] implementor.
pub struct ReadinessDriver {
    selector: Arc<Selector>,
    pending: HashMap<u64, PendingOp>,
    capabilities: Capabilities,
}

impl ReadinessDriver {
    pub fn new(config: &Config) -> io::Result<ReadinessDriver> {
        let selector = Arc::new(Selector::new()?);
        Ok(ReadinessDriver {
            selector,
            pending: HashMap::new(),
            capabilities: Capabilities {
                max_submissions: config.max_submissions.unwrap_or(1024),
                max_completions: config.max_completions.unwrap_or(256),
                batched_submission: false,
                registered_buffers: false,
                multishot: false,
                supported: SUPPORTED_KINDS,
            },
        })
    }

    fn handle_cancel(&mut self, target: u64) -> Vec<Event> {
        let Some(pending) = self.pending.remove(&target) else {
            return Vec::new();
        };
        let _ = self.selector.deregister(pending.descriptor);
        vec![Event {
            id: OperationId::new(target),
            kind: pending.kind,
            outcome: EventOutcome::Cancellation,
            flags: Flags::default(),
            buffer: pending.buffer,
        }]
    }

    fn submit_one(&mut self, mut op: Operation) -> Vec<Event> {
        let id = op.id();
        let kind = op.kind();

        if kind == Kind::Cancel {
            return self.handle_cancel(op.offset() as u64);
        }
        if let Err(err) = Capabilities::reject_unless(kind, SUPPORTED_KINDS) {
            return vec![synchronous_failure(id, kind, op.take_buffer(), err)];
        }
        if kind == Kind::Wakeup {
            return Vec::new();
        }

        let descriptor = op.descriptor();
        let offset = op.offset();
        let mut buffer = op.take_buffer();

        match try_perform(kind, descriptor, buffer.as_deref_mut(), offset) {
            Ok(Some(success)) => vec![completed(id, kind, success, buffer)],
            Ok(None) => {
                let interest = interest_for(kind);
                match self.selector.register(descriptor, id.as_u64(), interest) {
                    Ok(()) => {
                        self.pending.insert(
                            id.as_u64(),
                            PendingOp {
                                kind,
                                descriptor,
                                buffer,
                            },
                        );
                        Vec::new()
                    }
                    Err(err) => vec![synchronous_failure(id, kind, buffer, Error::from(err))],
                }
            }
            Err(err) => vec![synchronous_failure(id, kind, buffer, Error::from(err))],
        }
    }
}

impl Driver for ReadinessDriver {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn submit(&mut self, op: Operation) -> Vec<Event> {
        self.submit_one(op)
    }

    fn flush(&mut self) -> io::Result<usize> {
        // Every submission above is synchronous (either it completed inline
        // or it was registered with the selector), so there is nothing
        // batched to flush.
        Ok(0)
    }

    fn poll(&mut self, deadline: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        let ready = self.selector.select(deadline)?;
        let mut produced = 0;
        for (token, readable, writable, errored) in ready {
            let Some(pending) = self.pending.remove(&token) else {
                continue; // Already cancelled between select() returning and here.
            };
            let _ = self.selector.deregister(pending.descriptor);
            let id = OperationId::new(token);

            if errored {
                let code = socket_error(pending.descriptor).unwrap_or(-1);
                out.push(failure_event(
                    id,
                    pending.kind,
                    Error::Kernel {
                        code: Some(code),
                        message: "readiness backend observed an error condition".to_string(),
                    },
                ));
                produced += 1;
                continue;
            }
            let _ = (readable, writable);

            let mut buffer = pending.buffer;
            match try_perform(pending.kind, pending.descriptor, buffer.as_deref_mut(), 0) {
                Ok(Some(success)) => {
                    out.push(completed(id, pending.kind, success, buffer));
                    produced += 1;
                }
                Ok(None) => {
                    // Still not ready (spurious wakeup, or another waiter
                    // raced us to the data on an edge-triggered facility);
                    // re-register and keep waiting.
                    let interest = interest_for(pending.kind);
                    if self
                        .selector
                        .register(pending.descriptor, token, interest)
                        .is_ok()
                    {
                        self.pending.insert(
                            token,
                            PendingOp {
                                kind: pending.kind,
                                descriptor: pending.descriptor,
                                buffer,
                            },
                        );
                    }
                }
                Err(err) => {
                    out.push(failure_event(id, pending.kind, Error::from(err)));
                    produced += 1;
                }
            }
        }
        Ok(produced)
    }

    fn wakeup(&self) -> Arc<dyn WakeupChannel> {
        Arc::clone(&self.selector) as Arc<dyn WakeupChannel>
    }

    fn close(self: Box<Self>) {
        self.selector.close();
    }
}

fn interest_for(kind: Kind) -> Interest {
    match kind {
        Kind::Read | Kind::Recv | Kind::Accept => Interest::READ,
        Kind::Write | Kind::Send | Kind::Connect => Interest::WRITE,
        _ => Interest::READ,
    }
}

fn completed(id: OperationId, kind: Kind, success: Success, buffer: Option<Box<dyn Buffer>>) -> Event {
    Event {
        id,
        kind,
        outcome: EventOutcome::Success(success),
        flags: Flags::default(),
        buffer,
    }
}

fn synchronous_failure(
    id: OperationId,
    kind: Kind,
    buffer: Option<Box<dyn Buffer>>,
    err: impl Into<Error>,
) -> Event {
    Event {
        id,
        kind,
        outcome: EventOutcome::Failure(err.into()),
        flags: Flags::default(),
        buffer,
    }
}

fn failure_event(id: OperationId, kind: Kind, err: Error) -> Event {
    Event {
        id,
        kind,
        outcome: EventOutcome::Failure(err),
        flags: Flags::default(),
        buffer: None,
    }
}

/// Attempt `kind` against `descriptor` without blocking.
///
/// `Ok(Some(success))`: the operation finished right now. `Ok(None)`: it
/// would block; the caller should register for readiness and retry later.
/// `Err`: a genuine failure.
fn try_perform(
    kind: Kind,
    descriptor: Descriptor,
    buffer: Option<&mut (dyn Buffer + '_)>,
    offset: i64,
) -> io::Result<Option<Success>> {
    match kind {
        Kind::Nop => Ok(Some(Success::Completed)),
        Kind::Fsync => {
            let fd = descriptor.as_raw_fd();
            match syscall_retry(|| unsafe { libc::fsync(fd) }) {
                Ok(_) => Ok(Some(Success::Completed)),
                Err(err) => Err(err),
            }
        }
        Kind::Close => {
            let fd = descriptor.as_raw_fd();
            match syscall_retry(|| unsafe { libc::close(fd) }) {
                Ok(_) => Ok(Some(Success::Completed)),
                Err(err) => Err(err),
            }
        }
        Kind::Read | Kind::Recv => {
            let buffer = buffer.expect("Read/Recv submitted without a buffer");
            let slice = unsafe { std::slice::from_raw_parts_mut(buffer.as_mut_ptr(), buffer.len()) };
            let result = if offset >= 0 {
                pread(descriptor, slice, offset)
            } else {
                let mut file = borrowed_file(descriptor);
                file.read(slice)
            };
            match result {
                Ok(n) => Ok(Some(Success::Bytes(n))),
                Err(err) if would_block(&err) => Ok(None),
                Err(err) => Err(err),
            }
        }
        Kind::Write | Kind::Send => {
            let buffer = buffer.expect("Write/Send submitted without a buffer");
            let slice = unsafe { std::slice::from_raw_parts(buffer.as_ptr(), buffer.len()) };
            let result = if offset >= 0 {
                pwrite(descriptor, slice, offset)
            } else {
                let mut file = borrowed_file(descriptor);
                file.write(slice)
            };
            match result {
                Ok(n) => Ok(Some(Success::Bytes(n))),
                Err(err) if would_block(&err) => Ok(None),
                Err(err) => Err(err),
            }
        }
        Kind::Accept => {
            let fd = descriptor.as_raw_fd();
            let raw = unsafe { libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) };
            if raw >= 0 {
                let accepted = unsafe { Descriptor::from_raw_fd(raw) };
                Ok(Some(Success::Accepted(accepted)))
            } else {
                let err = io::Error::last_os_error();
                if would_block(&err) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
        Kind::Connect => {
            // The caller already issued `connect(2)`; our job is only to
            // wait for writability and surface the deferred result.
            match socket_error(descriptor) {
                Some(0) => Ok(Some(Success::Completed)),
                Some(code) => Err(io::Error::from_raw_os_error(code)),
                None => Ok(None),
            }
        }
        Kind::Cancel | Kind::Wakeup => unreachable!("handled before try_perform is called"),
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINPROGRESS
    )
}

/// Returns the `SO_ERROR` value for a socket descriptor, or `None` if the
/// getsockopt call itself fails (treated as "still pending" by callers).
fn socket_error(descriptor: Descriptor) -> Option<i32> {
    let fd = descriptor.as_raw_fd();
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        Some(err)
    } else {
        None
    }
}

/// Positional read via `pread(2)`: honors `offset` without disturbing the
/// descriptor's own file position, matching the `io_uring` backend's
/// `opcode::Read::offset` semantics instead of treating `offset` as a slice
/// into `buf`.
fn pread(descriptor: Descriptor, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    let fd = descriptor.as_raw_fd();
    let n = syscall_retry(|| unsafe {
        libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset as libc::off_t) as libc::c_int
    })?;
    Ok(n as usize)
}

/// Positional write via `pwrite(2)`, the write-side counterpart of [`pread`].
fn pwrite(descriptor: Descriptor, buf: &[u8], offset: i64) -> io::Result<usize> {
    let fd = descriptor.as_raw_fd();
    let n = syscall_retry(|| unsafe {
        libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), offset as libc::off_t) as libc::c_int
    })?;
    Ok(n as usize)
}

/// Wrap a borrowed descriptor in a `File` for the duration of one
/// read/write call without taking ownership — `ManuallyDrop` would be
/// equally correct here but `std::mem::forget` on the wrapper after use
/// reads less subtly in a short-lived helper like this.
fn borrowed_file(descriptor: Descriptor) -> std::mem::ManuallyDrop<std::fs::File> {
    std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(descriptor.as_raw_fd()) })
}

fn syscall_retry(mut f: impl FnMut() -> libc::c_int) -> io::Result<libc::c_int> {
    loop {
        let rc = f();
        if rc >= 0 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

