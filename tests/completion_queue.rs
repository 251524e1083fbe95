//! End-to-end coverage for the engine running against the readiness
//! backend: a real temporary file and a real pipe, not a driver stub.
//! Forces [`DriverChoice::Readiness`] rather than the platform default so
//! the suite behaves the same on every CI runner, `io_uring`-capable or not.
//!
//! Unix-only: the readiness adapter and `libc::pipe` are both Unix-specific
//! (the Windows side of this crate is exercised through the IOCP backend
//! instead, which needs a real IOCP-capable host to test against).
#![cfg(unix)]

mod common;

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use completion_rt::buffer::OwnedBuffer;
use completion_rt::config::DriverChoice;
use completion_rt::descriptor::Descriptor;
use completion_rt::operation::Success;
use completion_rt::{Config, Runtime};

fn readiness_runtime() -> Runtime {
    Runtime::new(Config::new().driver(DriverChoice::Readiness)).expect("readiness backend should always construct")
}

fn buffer_bytes(buffer: &dyn completion_rt::buffer::Buffer) -> &[u8] {
    unsafe { std::slice::from_raw_parts(buffer.as_ptr(), buffer.len()) }
}

#[test]
fn single_read_to_completion() {
    let mut file = tempfile::tempfile().expect("create anonymous temp file");
    file.write_all(b"Hello, World!").unwrap();

    let runtime = readiness_runtime();
    let descriptor = unsafe { Descriptor::from_raw_fd(file.as_raw_fd()) };
    let channel = runtime.channel(descriptor);

    let buffer = Box::new(OwnedBuffer::zeroed(4096));
    let result = common::block_on(channel.read(buffer, 0).expect("read is a supported kind")).expect("read completes");

    let Success::Bytes(n) = result.success else {
        panic!("expected Success::Bytes, got {:?}", result.success);
    };
    assert_eq!(n, 13);
    let bytes = buffer_bytes(result.buffer.as_deref().expect("buffer returned with the completion"));
    assert_eq!(&bytes[..n], b"Hello, World!");
}

#[test]
fn write_then_read_round_trips_through_the_same_file() {
    let file = tempfile::tempfile().expect("create anonymous temp file");

    let runtime = readiness_runtime();
    let descriptor = unsafe { Descriptor::from_raw_fd(file.as_raw_fd()) };
    let channel = runtime.channel(descriptor);

    let write_buf = Box::new(OwnedBuffer::from_vec(b"Written content".to_vec()));
    let written = common::block_on(channel.write(write_buf, 0).unwrap()).expect("write completes");
    assert!(matches!(written.success, Success::Bytes(15)));

    let read_buf = Box::new(OwnedBuffer::zeroed(100));
    let result = common::block_on(channel.read(read_buf, 0).unwrap()).expect("read completes");
    let Success::Bytes(n) = result.success else {
        panic!("expected Success::Bytes, got {:?}", result.success);
    };
    assert_eq!(n, 15);
    let bytes = buffer_bytes(result.buffer.as_deref().unwrap());
    assert_eq!(&bytes[..n], b"Written content");
}

#[test]
fn cancellation_wins_over_a_read_that_never_becomes_ready() {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe(2) failed");
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let runtime = readiness_runtime();
    let descriptor = unsafe { Descriptor::from_raw_fd(read_fd) };
    let channel = runtime.channel(descriptor);

    let buffer = Box::new(OwnedBuffer::zeroed(8));
    // offset -1: a pipe has no file position to seek within.
    let mut fut = Box::pin(channel.read(buffer, -1).unwrap());

    assert!(matches!(common::poll_once(fut.as_mut()), std::task::Poll::Pending));
    let id = fut.id().expect("the future carries an id once armed");

    std::thread::sleep(Duration::from_millis(10));
    channel.cancel(id).expect("cancel is accepted while the queue is open");

    let result = common::drive(fut.as_mut());
    let err = result.expect_err("a cancelled read must not resolve as a success");
    assert!(err.is_cancellation(), "expected a cancellation failure, got {err:?}");

    unsafe {
        libc::close(write_fd);
        libc::close(read_fd);
    }
}
