//! End-to-end coverage for [`HandlePool`] under real thread contention,
//! cancellation, capacity pressure, and cross-pool misuse.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;

use completion_rt::error::{Error, Failure};
use completion_rt::handle_pool::{HandleId, HandlePool};

/// Acquire `id` and block the holding thread inside the transaction body
/// until [`release`] is called, so the test can deterministically queue
/// waiters behind a resource it knows is still checked out.
struct Hold {
    join: thread::JoinHandle<()>,
    signal: Arc<(Mutex<bool>, Condvar)>,
}

fn hold_resource(pool: &Arc<HandlePool<usize>>, id: HandleId) -> Hold {
    let holding = Arc::new(AtomicBool::new(false));
    let signal = Arc::new((Mutex::new(false), Condvar::new()));
    let join = {
        let pool = Arc::clone(pool);
        let holding = Arc::clone(&holding);
        let signal = Arc::clone(&signal);
        thread::spawn(move || {
            common::block_on(pool.transaction(id, move |_resource: &mut usize| {
                // By the time the body runs, `Transaction::poll` has already
                // flipped the entry to `CheckedOut` under its lock, so this
                // flag is a reliable signal for the test thread below.
                holding.store(true, Ordering::SeqCst);
                let (lock, cvar) = &*signal;
                let mut released = lock.lock().unwrap();
                while !*released {
                    released = cvar.wait(released).unwrap();
                }
            }))
            .expect("holder transaction should succeed");
        })
    };
    while !holding.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    Hold { join, signal }
}

fn release(hold: Hold) {
    {
        let (lock, cvar) = &*hold.signal;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
    hold.join.join().expect("holder thread should not panic");
}

#[test]
fn handle_contention_every_task_completes_with_exactly_one_outcome() {
    #[derive(Debug, PartialEq, Eq)]
    enum Outcome {
        Acquired,
        Cancelled,
        Shutdown,
    }

    const TASKS: usize = 24;
    let pool: Arc<HandlePool<usize>> = Arc::new(HandlePool::new(TASKS));
    let id = pool.register(0usize).unwrap();
    let start = Arc::new(Barrier::new(TASKS + 1));

    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let pool = Arc::clone(&pool);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                if i % 3 == 0 {
                    // Simulate external cancellation: join the queue, then
                    // drop before it resolves, exactly as dropping a
                    // `Completion` does on the I/O side.
                    let mut fut = Box::pin(pool.transaction(id, |counter: &mut usize| {
                        *counter += 1;
                    }));
                    let _ = common::poll_once(fut.as_mut());
                    drop(fut);
                    Outcome::Cancelled
                } else {
                    match common::block_on(pool.transaction(id, |counter: &mut usize| {
                        *counter += 1;
                    })) {
                        Ok(_) => Outcome::Acquired,
                        Err(err) if err.is_shutdown() => Outcome::Shutdown,
                        Err(other) => panic!("unexpected transaction outcome: {other:?}"),
                    }
                }
            })
        })
        .collect();

    start.wait();
    pool.shutdown();

    let outcomes: Vec<Outcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outcomes.len(), TASKS);
    let cancelled = outcomes.iter().filter(|o| **o == Outcome::Cancelled).count();
    assert_eq!(cancelled, (0..TASKS).filter(|i| i % 3 == 0).count());
}

#[test]
fn capacity_stress_after_mass_cancel_with_an_active_holder() {
    const K: usize = 10;
    let pool: Arc<HandlePool<usize>> = Arc::new(HandlePool::new(K));
    let id = pool.register(0usize).unwrap();

    let hold = hold_resource(&pool, id);

    let mut waiters: Vec<_> = (0..K).map(|_| Box::pin(pool.transaction(id, |r: &mut usize| *r))).collect();
    for fut in waiters.iter_mut() {
        assert!(matches!(common::poll_once(fut.as_mut()), std::task::Poll::Pending));
    }
    let mut overflow = Box::pin(pool.transaction(id, |r: &mut usize| *r));
    assert!(
        matches!(
            common::poll_once(overflow.as_mut()),
            std::task::Poll::Ready(Err(Failure::Leaf(Error::WaitersFull)))
        ),
        "the Kth+1 waiter must be rejected while the queue is at capacity"
    );
    drop(overflow);

    for fut in waiters {
        drop(fut); // cancel all K queued waiters
    }
    release(hold);

    // A fresh holder, so the next K registrations genuinely have to queue
    // rather than being serviced immediately against an Open resource.
    let hold = hold_resource(&pool, id);
    let mut waiters: Vec<_> = (0..K).map(|_| Box::pin(pool.transaction(id, |r: &mut usize| *r))).collect();
    for (i, fut) in waiters.iter_mut().enumerate() {
        assert!(
            matches!(common::poll_once(fut.as_mut()), std::task::Poll::Pending),
            "waiter {i} should have been accepted: the mass cancel above must have freed its slot"
        );
    }
    for fut in waiters {
        drop(fut);
    }
    release(hold);
}

#[test]
fn scope_mismatch_is_rejected_and_leaves_the_origin_pool_untouched() {
    let p1: Arc<HandlePool<usize>> = Arc::new(HandlePool::new(8));
    let p2: Arc<HandlePool<usize>> = Arc::new(HandlePool::new(8));

    let id1 = p1.register(7).unwrap();
    let err = common::block_on(p2.transaction(id1, |_| ())).unwrap_err();
    assert!(matches!(err, Failure::Leaf(Error::ScopeMismatch)));

    assert!(p1.is_open(id1));
    let value = common::block_on(p1.transaction(id1, |r: &mut usize| *r)).unwrap();
    assert_eq!(value, 7);
}

