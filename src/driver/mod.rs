//! Driver witness: a small dispatch table over
//! create/submit/flush/poll/close/create_wakeup, realized as Rust's
//! idiomatic stand-in for a protocol-witness struct — a `dyn Driver` trait
//! object, with one implementor per backend. New backends are added by
//! writing a new implementor, never by extending an inheritance hierarchy.

#[cfg(target_os = "linux")]
pub mod io_uring;
#[cfg(windows)]
pub mod iocp;
#[cfg(unix)]
pub mod readiness;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, DriverChoice};
use crate::error::Error;
use crate::operation::{Event, Kind, Operation};
use crate::queues::WakeupChannel;

/// Capabilities a backend declares at construction time. Consumed by the
/// poll loop to size its reusable buffers and by submit paths to validate
/// operation kinds before ever touching the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub max_submissions: usize,
    pub max_completions: usize,
    pub batched_submission: bool,
    pub registered_buffers: bool,
    pub multishot: bool,
    /// The operation kinds this backend actually implements. Consulted by
    /// [`crate::channel::Channel`] to reject an unsupported kind before it
    /// ever reaches the submission queue.
    pub supported: &'static [Kind],
}

/// Every kind a fully-capable backend (`io_uring`, IOCP) implements.
pub const ALL_KINDS: &[Kind] = &[
    Kind::Nop,
    Kind::Read,
    Kind::Write,
    Kind::Accept,
    Kind::Connect,
    Kind::Send,
    Kind::Recv,
    Kind::Fsync,
    Kind::Close,
];

impl Capabilities {
    /// `true` if `kind` is listed in `supported`. Backends that support
    /// everything pass [`ALL_KINDS`] at construction; this helper exists so
    /// the check itself reads the same everywhere it's used.
    pub fn reject_unless(kind: Kind, supported: &[Kind]) -> Result<(), Error> {
        if supported.contains(&kind) {
            Ok(())
        } else {
            Err(Error::UnsupportedKind(kind))
        }
    }
}

/// The dispatch table every backend implements.
///
/// `submit` must never resume a caller's continuation — it only ever
/// returns an immediate error (e.g. a capability mismatch) or succeeds in
/// handing the operation to the kernel; the eventual result always arrives
/// through [`Driver::poll`] as an [`Event`].
pub trait Driver: Send {
    /// This backend's declared capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Hand one operation to the kernel (or, for the readiness adapter, arm
    /// a descriptor for the right readiness event). On synchronous failure
    /// the operation's buffer must be returned via the returned `Event`
    /// path, not silently dropped — callers push a synthetic failure event
    /// rather than propagating `io::Error` directly, so the completion
    /// queue's normal drain path is the only place that resumes a caller.
    fn submit(&mut self, op: Operation) -> Vec<Event>;

    /// Flush any batched submissions (`io_uring_enter`; a no-op for IOCP
    /// and the readiness adapter, which submit synchronously).
    fn flush(&mut self) -> io::Result<usize>;

    /// Block until at least one event is available, or `deadline` elapses
    /// (`None` means wait indefinitely), appending completions to `out`.
    fn poll(&mut self, deadline: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize>;

    /// A cheaply-cloneable, `Send + Sync` handle usable to interrupt a
    /// blocked `poll` call from any thread — including after this driver
    /// has been moved onto the dedicated poll thread. Returning an `Arc`
    /// (rather than a borrow tied to `&self`) is this crate's realization
    /// of "`createWakeup`: Channel is Sendable": the channel must outlive
    /// and be usable independently of the driver object that created it.
    fn wakeup(&self) -> Arc<dyn WakeupChannel>;

    /// Consume and release the backend's platform resources.
    fn close(self: Box<Self>);
}

/// Construct the best backend available for `config`: `io_uring` on Linux
/// when the kernel supports it, IOCP on Windows, the readiness adapter
/// (kqueue/epoll) everywhere else or when [`DriverChoice::Readiness`] is
/// forced.
pub fn create(config: &Config) -> io::Result<Box<dyn Driver>> {
    match config.driver {
        DriverChoice::Readiness => {
            #[cfg(unix)]
            {
                return readiness::ReadinessDriver::new(config).map(|d| Box::new(d) as Box<dyn Driver>);
            }
            #[cfg(not(unix))]
            {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "the readiness adapter is only available on unix",
                ));
            }
        }
        DriverChoice::Auto => create_best(config),
    }
}

#[cfg(target_os = "linux")]
fn create_best(config: &Config) -> io::Result<Box<dyn Driver>> {
    // Mirrors the teacher's own `mio_unsupported_force_poll_poll` escape
    // hatch: set via `RUSTFLAGS=--cfg completion_rt_force_readiness` to
    // exercise the readiness adapter on a kernel that actually has
    // `io_uring`, without touching `Config`.
    if cfg!(completion_rt_force_readiness) {
        return readiness::ReadinessDriver::new(config).map(|d| Box::new(d) as Box<dyn Driver>);
    }
    match io_uring::IoUringDriver::new(config) {
        Ok(driver) => Ok(Box::new(driver)),
        Err(err) => {
            log::warn!("io_uring unavailable ({err}), falling back to the readiness adapter");
            readiness::ReadinessDriver::new(config).map(|d| Box::new(d) as Box<dyn Driver>)
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn create_best(config: &Config) -> io::Result<Box<dyn Driver>> {
    readiness::ReadinessDriver::new(config).map(|d| Box::new(d) as Box<dyn Driver>)
}

#[cfg(windows)]
fn create_best(config: &Config) -> io::Result<Box<dyn Driver>> {
    iocp::IocpDriver::new(config).map(|d| Box::new(d) as Box<dyn Driver>)
}
