//! [`Descriptor`]: the opaque, borrowed platform handle.
//!
//! The engine never owns a `Descriptor` — whoever opened the underlying fd
//! or `HANDLE` is responsible for closing it; we only borrow it for the
//! duration of a submitted operation. Per-descriptor wrappers (sockets,
//! files) live outside this crate; `Descriptor` is the minimal interface
//! those external wrappers are expected to expose.

use std::fmt;

#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawHandle;

/// An opaque, non-owning platform I/O handle.
///
/// `Descriptor` is `Copy` because it never owns the resource it names; the
/// caller who opened the fd/`HANDLE` is the sole owner and must outlive
/// every operation submitted against it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Descriptor(Raw);

#[cfg(unix)]
type Raw = RawFd;
#[cfg(windows)]
type Raw = RawHandle;

impl Descriptor {
    /// A descriptor value that never names a real resource.
    ///
    /// Used only as the placeholder `descriptor` field of a `Cancel`
    /// operation, whose actual target is carried in `offset`, not in its
    /// own descriptor — backends must never dereference this value.
    #[cfg(unix)]
    pub(crate) const INVALID: Descriptor = Descriptor(-1);
    #[cfg(windows)]
    pub(crate) const INVALID: Descriptor = Descriptor(std::ptr::null_mut());

    /// Wrap a raw Unix file descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must name a currently-open descriptor for the lifetime of every
    /// operation submitted against this `Descriptor`.
    #[cfg(unix)]
    pub unsafe fn from_raw_fd(fd: RawFd) -> Descriptor {
        Descriptor(fd)
    }

    /// Returns the underlying raw file descriptor.
    #[cfg(unix)]
    pub fn as_raw_fd(self) -> RawFd {
        self.0
    }

    /// Wrap a raw Windows `HANDLE`.
    ///
    /// # Safety
    ///
    /// `handle` must name a currently-open, overlapped-capable handle for the
    /// lifetime of every operation submitted against this `Descriptor`.
    #[cfg(windows)]
    pub unsafe fn from_raw_handle(handle: RawHandle) -> Descriptor {
        Descriptor(handle)
    }

    /// Returns the underlying raw `HANDLE`.
    #[cfg(windows)]
    pub fn as_raw_handle(self) -> RawHandle {
        self.0
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor").field(&self.0).finish()
    }
}

// SAFETY: a `Descriptor` is an inert integer/pointer-sized identifier; the
// engine never dereferences it directly, only hands it to the kernel via a
// backend. The wrapper who owns the real resource is responsible for actual
// thread-safety of concurrent use.
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}
