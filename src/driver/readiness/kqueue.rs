//! BSD/macOS selector backend: `kqueue` plus an `EVFILT_USER` waker, the
//! same pairing `mio`'s own `sys::unix::selector::kqueue` and
//! `sys::unix::waker::kqueue` use.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::descriptor::Descriptor;
use crate::macros::syscall;
use crate::queues::WakeupChannel;

use super::Interest;

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

macro_rules! kevent {
    ($id:expr, $filter:expr, $flags:expr, $data:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as *mut libc::c_void,
        }
    };
}

#[derive(Debug)]
pub(super) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(super) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        let selector = Selector {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
        };
        selector.setup_wakeup()?;
        Ok(selector)
    }

    fn setup_wakeup(&self) -> io::Result<()> {
        let mut event = kevent!(
            0,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            super::WAKEUP_TOKEN
        );
        kevent_register(self.kq.as_raw_fd(), std::slice::from_mut(&mut event), &[])
    }

    pub(super) fn register(&self, descriptor: Descriptor, token: u64, interest: Interest) -> io::Result<()> {
        self.register_raw(descriptor.as_raw_fd(), token, interest)
    }

    fn register_raw(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT | libc::EV_ONESHOT;
        let mut changes: [MaybeUninit<libc::kevent>; 2] =
            [MaybeUninit::uninit(), MaybeUninit::uninit()];
        let mut n = 0;
        if interest.writable {
            changes[n] = MaybeUninit::new(kevent!(fd, libc::EVFILT_WRITE, flags, token));
            n += 1;
        }
        if interest.readable {
            changes[n] = MaybeUninit::new(kevent!(fd, libc::EVFILT_READ, flags, token));
            n += 1;
        }
        let changes = unsafe { std::slice::from_raw_parts_mut(changes[0].as_mut_ptr(), n) };
        // EPIPE can surface when registering the read end of a pipe whose
        // write end has already closed; harmless, kqueue still reports EOF.
        kevent_register(self.kq.as_raw_fd(), changes, &[libc::EPIPE as Data])
    }

    pub(super) fn deregister(&self, descriptor: Descriptor) -> io::Result<()> {
        let fd = descriptor.as_raw_fd();
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_WRITE, flags, 0u64),
            kevent!(fd, libc::EVFILT_READ, flags, 0u64),
        ];
        // Single-use, one-shot registrations: by the time we deregister,
        // the kernel may already have auto-removed the filter that fired.
        kevent_register(self.kq.as_raw_fd(), &mut changes, &[libc::ENOENT as Data])
    }

    pub(super) fn select(&self, timeout: Option<Duration>) -> io::Result<Vec<(u64, bool, bool, bool)>> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map(|t| t as *const _).unwrap_or(ptr::null());

        let mut events: Vec<libc::kevent> = vec![unsafe { std::mem::zeroed() }; 256];
        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.len() as Count,
            ts_ptr,
        ))?;

        let mut out = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            let token = event.udata as u64;
            if token == super::WAKEUP_TOKEN && event.filter == libc::EVFILT_USER {
                continue;
            }
            let readable = event.filter == libc::EVFILT_READ;
            let writable = event.filter == libc::EVFILT_WRITE;
            let errored = (event.flags & libc::EV_ERROR) != 0
                || ((event.flags & libc::EV_EOF) != 0 && event.fflags != 0);
            out.push((token, readable, writable, errored));
        }
        Ok(out)
    }

    pub(super) fn wake(&self) -> io::Result<()> {
        let mut event = kevent!(
            0,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_RECEIPT,
            super::WAKEUP_TOKEN
        );
        event.fflags = libc::NOTE_TRIGGER;
        kevent_register(self.kq.as_raw_fd(), std::slice::from_mut(&mut event), &[])
    }

    pub(super) fn close(&self) {}
}

impl WakeupChannel for Selector {
    fn wake(&self) -> io::Result<()> {
        Selector::wake(self)
    }

    fn close(&self) {
        Selector::close(self)
    }
}

fn kevent_register(kq: RawFd, changes: &mut [libc::kevent], ignored: &[Data]) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| {
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(())
        } else {
            Err(err)
        }
    })
    .and_then(|()| check_errors(changes, ignored))
}

fn check_errors(events: &[libc::kevent], ignored: &[Data]) -> io::Result<()> {
    for event in events {
        let data = event.data;
        if (event.flags & libc::EV_ERROR != 0) && data != 0 && !ignored.contains(&data) {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}
