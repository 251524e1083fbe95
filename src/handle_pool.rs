//! [`HandlePool`]: an actor-isolated map from [`HandleId`] to an
//! application-owned resource, serializing exclusive access per handle
//! through a [`WaiterQueue`].
//!
//! There is no language-level actor in Rust, so single-writer isolation is
//! funneled through a plain `Mutex<Inner<R>>` held for the duration of every
//! mutation — the same "funnel all mutations through a re-entrant mutex held
//! by a single owner" substitution the engine uses for the completion queue.
//! The mutex is never held across a suspension point: [`Transaction::poll`]
//! always drops it before running the caller's body and before returning
//! `Poll::Pending`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::config::Config;
use crate::error::{Error, Failure};
use crate::waiter::Waiter;
use crate::waiter_queue::{RegisterRejection, TicketId, WaiterQueue};

/// Identifies a resource registered with a particular [`HandlePool`]
/// instance. `scope` is a per-pool nonce: presenting an ID minted by a
/// different pool is rejected before any lookup happens, rather than
/// risking an accidental hit against an unrelated slot with the same `raw`
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    raw: u64,
    scope: u64,
}

enum EntryState {
    Open,
    CheckedOut,
    Destroying,
    Destroyed,
}

struct PoolEntry<R> {
    resource: Option<R>,
    state: EntryState,
    waiters: WaiterQueue<Arc<Waiter>>,
}

struct Inner<R> {
    scope: u64,
    next_raw: u64,
    entries: HashMap<u64, PoolEntry<R>>,
    shutdown: bool,
}

/// An actor-isolated pool of application resources addressed by
/// [`HandleId`], with FIFO-serialized exclusive access per resource.
pub struct HandlePool<R> {
    inner: Mutex<Inner<R>>,
    waiters_limit: usize,
}

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

impl<R> HandlePool<R> {
    /// A fresh pool. `waiters_limit` bounds the per-handle FIFO queue of
    /// tasks contending for the same resource.
    pub fn new(waiters_limit: usize) -> HandlePool<R> {
        HandlePool {
            inner: Mutex::new(Inner {
                scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
                next_raw: 1,
                entries: HashMap::new(),
                shutdown: false,
            }),
            waiters_limit,
        }
    }

    /// A fresh pool using `config`'s [`Config::handle_waiters_limit`] knob
    /// — the usual constructor for embedders that already built a `Config`
    /// for a [`crate::Runtime`] and want this pool's per-handle capacity to
    /// track the same setting.
    pub fn with_config(config: &Config) -> HandlePool<R> {
        HandlePool::new(config.handle_waiters_limit)
    }

    /// Register `resource`, returning a fresh [`HandleId`]. Fails if the
    /// pool is shutting down.
    pub fn register(&self, resource: R) -> Result<HandleId, Failure> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return Err(Failure::shutdown_in_progress());
        }
        let raw = inner.next_raw;
        inner.next_raw += 1;
        let scope = inner.scope;
        inner.entries.insert(
            raw,
            PoolEntry {
                resource: Some(resource),
                state: EntryState::Open,
                waiters: WaiterQueue::with_capacity(self.waiters_limit),
            },
        );
        Ok(HandleId { raw, scope })
    }

    /// Acquire exclusive access to the resource named by `id`, run `body`,
    /// and release it. Concurrent callers on the same `id` serialize FIFO
    /// through the handle's bounded waiter queue.
    pub fn transaction<F, T>(&self, id: HandleId, body: F) -> Transaction<'_, R, F>
    where
        F: FnOnce(&mut R) -> T,
    {
        Transaction {
            pool: self,
            id,
            body: Some(body),
            phase: Phase::Start,
        }
    }

    /// Mark `id` for destruction: in-flight and queued waiters wake with
    /// [`Error::InvalidHandle`]. Idempotent.
    pub fn destroy(&self, id: HandleId) {
        let mut inner = self.inner.lock().unwrap();
        if id.scope != inner.scope {
            return;
        }
        if let Some(entry) = inner.entries.get_mut(&id.raw) {
            entry.state = EntryState::Destroying;
            entry.resource = None;
            for (_, waiter) in entry.waiters.close_and_drain() {
                wake(&waiter);
            }
            entry.state = EntryState::Destroyed;
        }
    }

    /// `true` if `id` is registered, not destroyed, and in the right scope.
    pub fn is_open(&self, id: HandleId) -> bool {
        let inner = self.inner.lock().unwrap();
        if id.scope != inner.scope {
            return false;
        }
        matches!(
            inner.entries.get(&id.raw).map(|e| &e.state),
            Some(EntryState::Open) | Some(EntryState::CheckedOut)
        )
    }

    /// `true` if `id` is registered and not destroyed. Currently identical
    /// to [`HandlePool::is_open`]; kept as a distinct method because the two
    /// questions ("can I use this right now" vs. "does this identify
    /// anything at all") read differently at call sites and may diverge if
    /// a reservation-without-checkout state is added later.
    pub fn is_valid(&self, id: HandleId) -> bool {
        self.is_open(id)
    }

    /// Close every entry, waking all queued and in-flight waiters with
    /// [`crate::error::Lifecycle::ShutdownInProgress`]. Idempotent. After
    /// this returns, every subsequent `register`/`transaction` call fails.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        inner.shutdown = true;
        for entry in inner.entries.values_mut() {
            entry.state = EntryState::Destroyed;
            entry.resource = None;
            for (_, waiter) in entry.waiters.close_and_drain() {
                wake(&waiter);
            }
        }
    }
}

fn wake(waiter: &Arc<Waiter>) {
    if let Some((w, _was_cancelled)) = waiter.take_for_resume() {
        w.wake();
    }
}

enum Phase {
    Start,
    Waiting { ticket: TicketId, waiter: Arc<Waiter> },
    Done,
}

/// The future returned by [`HandlePool::transaction`].
///
/// Dropping a pending `Transaction` cancels it: its ticket is evicted from
/// the handle's waiter queue and its [`Waiter`] is flipped to cancelled,
/// exactly the way the engine treats external cancellation elsewhere — a
/// bit flip, never a direct resumption. Nothing further needs to happen:
/// `HandlePool` never granted this ticket the resource directly (see
/// `Transaction::poll`), so there is nothing to hand back.
pub struct Transaction<'a, R, F> {
    pool: &'a HandlePool<R>,
    id: HandleId,
    body: Option<F>,
    phase: Phase,
}

impl<'a, R, F, T> Future for Transaction<'a, R, F>
where
    F: FnOnce(&mut R) -> T,
{
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // None of `Transaction`'s fields are self-referential, so
        // reborrowing through the pin is sound.
        let this = self.get_mut();
        loop {
            match &this.phase {
                Phase::Waiting { ticket, .. } => {
                    let ticket = *ticket;
                    let mut inner = this.pool.inner.lock().unwrap();
                    if inner.shutdown {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(Failure::shutdown_in_progress()));
                    }
                    let Some(entry) = inner.entries.get_mut(&this.id.raw) else {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(Error::InvalidHandle.into()));
                    };
                    if matches!(entry.state, EntryState::Destroying | EntryState::Destroyed) {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(Error::InvalidHandle.into()));
                    }
                    if entry.waiters.contains(ticket) {
                        // Still our turn to wait; the waker installed when
                        // we registered will drive a future poll.
                        return Poll::Pending;
                    }
                    // Our turn came up (dequeued by a release). Retry
                    // acquisition from scratch under the same lock.
                    drop(inner);
                    this.phase = Phase::Start;
                    continue;
                }
                Phase::Start => {
                    let mut inner = this.pool.inner.lock().unwrap();
                    if inner.shutdown {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(Failure::shutdown_in_progress()));
                    }
                    if this.id.scope != inner.scope {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(Error::ScopeMismatch.into()));
                    }
                    let Some(entry) = inner.entries.get_mut(&this.id.raw) else {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(Error::InvalidHandle.into()));
                    };
                    if matches!(entry.state, EntryState::Destroying | EntryState::Destroyed) {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(Error::InvalidHandle.into()));
                    }

                    if matches!(entry.state, EntryState::Open) {
                        entry.state = EntryState::CheckedOut;
                        let mut resource =
                            entry.resource.take().expect("Open entries hold their resource");
                        drop(inner);

                        let body = this
                            .body
                            .take()
                            .expect("Transaction polled again after yielding Poll::Ready");
                        let result = body(&mut resource);

                        let mut inner = this.pool.inner.lock().unwrap();
                        if let Some(entry) = inner.entries.get_mut(&this.id.raw) {
                            if !matches!(
                                entry.state,
                                EntryState::Destroying | EntryState::Destroyed
                            ) {
                                entry.resource = Some(resource);
                                entry.state = EntryState::Open;
                                if let Some((_, waiter)) = entry.waiters.dequeue() {
                                    wake(&waiter);
                                }
                            }
                        }
                        this.phase = Phase::Done;
                        return Poll::Ready(Ok(result));
                    }

                    // Someone else holds it: queue up behind them.
                    let ticket = match entry.waiters.register() {
                        Ok(ticket) => ticket,
                        Err(RegisterRejection::Full) => {
                            this.phase = Phase::Done;
                            return Poll::Ready(Err(Error::WaitersFull.into()));
                        }
                        Err(RegisterRejection::Closed) => {
                            this.phase = Phase::Done;
                            return Poll::Ready(Err(Failure::shutdown_in_progress()));
                        }
                    };
                    let waiter = Arc::new(Waiter::new());
                    waiter.arm(cx.waker().clone()).expect(
                        "a ticket just registered under this lock can't be cancelled yet",
                    );
                    entry
                        .waiters
                        .arm(ticket, Arc::clone(&waiter))
                        .expect("ticket was just registered and can't have been evicted yet");
                    drop(inner);
                    this.phase = Phase::Waiting { ticket, waiter };
                    return Poll::Pending;
                }
                Phase::Done => panic!("Transaction polled again after completion"),
            }
        }
    }
}

impl<'a, R, F> Drop for Transaction<'a, R, F> {
    fn drop(&mut self) {
        if let Phase::Waiting { ticket, waiter } = &self.phase {
            let mut inner = self.pool.inner.lock().unwrap();
            if let Some(entry) = inner.entries.get_mut(&self.id.raw) {
                entry.waiters.cancel(*ticket);
            }
            waiter.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::{RawWaker, RawWakerVTable, Waker};

    fn noop_waker() -> Waker {
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

    fn poll_once<Fut: Future>(fut: Pin<&mut Fut>) -> Poll<Fut::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        fut.poll(&mut cx)
    }

    #[test]
    fn with_config_uses_its_handle_waiters_limit() {
        use std::sync::{Condvar, Mutex as StdMutex};
        use std::thread;

        let pool: Arc<HandlePool<i32>> = Arc::new(HandlePool::with_config(&Config::new().handle_waiters_limit(1)));
        let id = pool.register(0).unwrap();

        let holding = Arc::new(AtomicUsize::new(0));
        let release = Arc::new((StdMutex::new(false), Condvar::new()));
        let holder = {
            let pool = Arc::clone(&pool);
            let holding = Arc::clone(&holding);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                block_on(pool.transaction(id, |_| {
                    holding.store(1, Ordering::SeqCst);
                    let (lock, cvar) = &*release;
                    let mut released = lock.lock().unwrap();
                    while !*released {
                        released = cvar.wait(released).unwrap();
                    }
                }))
                .unwrap();
            })
        };
        while holding.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }

        // Capacity 1: one waiter queues, a second is rejected outright.
        let mut first = Box::pin(pool.transaction(id, |_| ()));
        assert!(matches!(poll_once(first.as_mut()), Poll::Pending));
        let mut second = Box::pin(pool.transaction(id, |_| ()));
        assert!(matches!(
            poll_once(second.as_mut()),
            Poll::Ready(Err(Failure::Leaf(Error::WaitersFull)))
        ));
        drop(first);
        drop(second);

        {
            let (lock, cvar) = &*release;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        holder.join().unwrap();
    }

    #[test]
    fn register_then_immediate_transaction_succeeds() {
        let pool: HandlePool<i32> = HandlePool::new(4);
        let id = pool.register(41).unwrap();
        let fut = pool.transaction(id, |r| {
            *r += 1;
            *r
        });
        block_on(fut).unwrap();
        assert!(pool.is_open(id));
    }

    #[test]
    fn scope_mismatch_is_rejected() {
        let p1: HandlePool<i32> = HandlePool::new(4);
        let p2: HandlePool<i32> = HandlePool::new(4);
        let id1 = p1.register(0).unwrap();
        let err = block_on(p2.transaction(id1, |_| ())).unwrap_err();
        assert!(matches!(err, Failure::Leaf(Error::ScopeMismatch)));
        assert!(p1.is_open(id1));
    }

    #[test]
    fn shutdown_rejects_new_registration_and_transactions() {
        let pool: HandlePool<i32> = HandlePool::new(4);
        let id = pool.register(0).unwrap();
        pool.shutdown();
        assert!(pool.register(1).is_err());
        let err = block_on(pool.transaction(id, |_| ())).unwrap_err();
        assert!(err.is_shutdown());
    }

    #[test]
    fn destroy_invalidates_the_handle() {
        let pool: HandlePool<i32> = HandlePool::new(4);
        let id = pool.register(0).unwrap();
        pool.destroy(id);
        assert!(!pool.is_open(id));
        let err = block_on(pool.transaction(id, |_| ())).unwrap_err();
        assert!(matches!(err, Failure::Leaf(Error::InvalidHandle)));
    }

    #[test]
    fn contention_serializes_and_every_waiter_completes_once() {
        use std::thread;

        let pool: Arc<HandlePool<usize>> = Arc::new(HandlePool::new(32));
        let id = pool.register(0).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let completed = Arc::clone(&completed);
                thread::spawn(move || {
                    let result = block_on(pool.transaction(id, |r| {
                        *r += 1;
                    }));
                    if result.is_ok() {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 8);
        block_on(pool.transaction(id, |r| assert_eq!(*r, 8))).unwrap();
    }

    /// Minimal single-threaded executor for tests: this crate has no
    /// runtime dependency, so transactions are driven to completion with a
    /// spin-poll loop rather than pulling in an async executor crate.
    fn block_on<Fut: Future>(fut: Fut) -> Fut::Output {
        let mut fut = Box::pin(fut);
        loop {
            match poll_once(fut.as_mut()) {
                Poll::Ready(out) => return out,
                Poll::Pending => std::thread::yield_now(),
            }
        }
    }
}
