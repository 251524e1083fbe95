//! Linux/Android selector backend: `epoll` plus an `eventfd` waker, the
//! same pairing `mio`'s own `sys::unix::selector::epoll` and
//! `sys::unix::waker::eventfd` use (`other_examples` / teacher).

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use crate::descriptor::Descriptor;
use crate::macros::syscall;
use crate::queues::WakeupChannel;

use super::Interest;

#[derive(Debug)]
pub(super) struct Selector {
    epoll: OwnedFd,
    // `eventfd` doubles as the wakeup primitive; wrapped in a `Mutex<File>`
    // purely so `wake`/`reset` can use `Read`/`Write` through a `&self`
    // receiver, matching `mio`'s `WakerInternal`.
    wakeup: Mutex<std::fs::File>,
}

fn interests_to_epoll(interest: Interest) -> u32 {
    // Level-triggered, not edge/oneshot: each registration is single-use by
    // construction (the adapter deregisters the instant it services the
    // readiness notification), so there is no risk of re-delivery before
    // that deregister runs.
    let mut events = 0u32;
    if interest.readable {
        events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.writable {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

impl Selector {
    pub(super) fn new() -> io::Result<Selector> {
        let epoll = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        let wakeup_fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        let wakeup = unsafe { std::fs::File::from_raw_fd(wakeup_fd) };
        let selector = Selector {
            epoll,
            wakeup: Mutex::new(wakeup),
        };
        selector.register_raw(selector.wakeup.lock().unwrap().as_raw_fd(), super::WAKEUP_TOKEN, Interest::READ)?;
        Ok(selector)
    }

    pub(super) fn register(&self, descriptor: Descriptor, token: u64, interest: Interest) -> io::Result<()> {
        self.register_raw(descriptor.as_raw_fd(), token, interest)
    }

    fn register_raw(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interest),
            u64: token,
        };
        syscall!(epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(super) fn deregister(&self, descriptor: Descriptor) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            descriptor.as_raw_fd(),
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    pub(super) fn select(&self, timeout: Option<Duration>) -> io::Result<Vec<(u64, bool, bool, bool)>> {
        let millis = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; 256];
        let n = syscall!(epoll_wait(
            self.epoll.as_raw_fd(),
            events.as_mut_ptr(),
            events.len() as i32,
            millis,
        ))?;

        let mut out = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            if event.u64 == super::WAKEUP_TOKEN {
                self.ack_wakeup();
                continue;
            }
            let bits = event.events as libc::c_int;
            let readable = bits & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0;
            let writable = bits & libc::EPOLLOUT != 0;
            let errored = bits & (libc::EPOLLERR | libc::EPOLLHUP) != 0;
            out.push((event.u64, readable, writable, errored));
        }
        Ok(out)
    }

    fn ack_wakeup(&self) {
        let mut buf = [0u8; 8];
        let _ = self.wakeup.lock().unwrap().read(&mut buf);
    }

    pub(super) fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        match self.wakeup.lock().unwrap().write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(super) fn close(&self) {
        // `OwnedFd`/`File` close on drop; nothing to do synchronously ahead
        // of that beyond what dropping the `Selector` already does.
    }
}

impl WakeupChannel for Selector {
    fn wake(&self) -> io::Result<()> {
        Selector::wake(self)
    }

    fn close(&self) {
        Selector::close(self)
    }
}
