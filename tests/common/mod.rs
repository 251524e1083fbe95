//! Shared driving helpers for the end-to-end tests.
//!
//! This crate has no async-runtime dependency, so integration tests drive
//! futures the same way the in-crate unit tests do: a no-op waker and a
//! spin-poll loop. Real wakeups still matter for correctness (the poll
//! thread and the completion-drain thread talk to each other via genuine
//! `Waker`s) — what's spin-polled here is only the test's own observation
//! of "is it done yet".

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        raw()
    }
    fn noop(_: *const ()) {}
    fn raw() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw()) }
}

pub fn poll_once<Fut: Future>(fut: Pin<&mut Fut>) -> Poll<Fut::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    fut.poll(&mut cx)
}

/// Drive an already-pinned future to completion, for tests that need to
/// inspect intermediate state (e.g. an operation id) between the first poll
/// and the final one.
pub fn drive<Fut: Future>(mut fut: Pin<&mut Fut>) -> Fut::Output {
    loop {
        match poll_once(fut.as_mut()) {
            Poll::Ready(out) => return out,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}

pub fn block_on<Fut: Future>(fut: Fut) -> Fut::Output {
    let mut fut = Box::pin(fut);
    drive(fut.as_mut())
}
