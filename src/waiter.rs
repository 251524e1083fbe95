//! [`Waiter`]: the per-submission typestate cell.
//!
//! A `Waiter` pairs a cancellation bit with a one-shot wakeup latch. It is
//! the single place in the engine where "did the caller's continuation get
//! resumed" is decided, and it is built so that exactly one of
//! {completion, cancellation, shutdown} can ever win that race.
//!
//! The continuation here is a [`std::task::Waker`]. Installing it (`arm`)
//! always happens synchronously on the first poll of the
//! [`crate::completion_queue::Completion`] future, *before* the operation is
//! pushed onto the submission queue, so the six states below are exactly
//! the reachable ones: an entry can never be observed mid-drain without a
//! continuation installed (see `completion_queue::Completion::poll`).

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::Waker;

// The three independent bits that make up a `State`: cancelled, armed,
// drained. Only six of the eight combinations are reachable; see the module
// doc comment and `State`'s variants.
const CANCELLED: u8 = 0b001;
const ARMED: u8 = 0b010;
const DRAINED: u8 = 0b100;

/// The waiter's atomic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No continuation installed yet, not cancelled.
    Unarmed = 0,
    /// Cancelled before a continuation was installed.
    CancelledUnarmed = CANCELLED,
    /// Continuation installed, not cancelled.
    Armed = ARMED,
    /// Continuation installed, then cancelled.
    ArmedCancelled = ARMED | CANCELLED,
    /// Terminal: resumed via the success path.
    Drained = ARMED | DRAINED,
    /// Terminal: resumed via the cancellation path.
    CancelledDrained = ARMED | CANCELLED | DRAINED,
}

impl State {
    fn from_bits(bits: u8) -> State {
        match bits {
            0 => State::Unarmed,
            CANCELLED => State::CancelledUnarmed,
            ARMED => State::Armed,
            x if x == ARMED | CANCELLED => State::ArmedCancelled,
            x if x == ARMED | DRAINED => State::Drained,
            x if x == ARMED | CANCELLED | DRAINED => State::CancelledDrained,
            other => unreachable!("waiter reached an unrepresentable state: {other:#05b}"),
        }
    }

    /// Terminal states (`drained`, `cancelledDrained`) are the only ones
    /// from which no further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Drained | State::CancelledDrained)
    }
}

/// A single-shot, race-free cell pairing a cancellation bit with a wakeup
/// latch.
///
/// # Invariants upheld here
///
/// - [`Waiter::arm`] installs the continuation at most once; a second call
///   while already armed is a programming error and panics.
/// - [`Waiter::cancel`] never returns a continuation to resume; it only
///   flips a bit.
/// - [`Waiter::take_for_resume`] returns `Some` to exactly one caller; every
///   later call (or a call that lost the race) returns `None`.
pub struct Waiter {
    state: AtomicU8,
    // Written only under `unarmed -> armed` or `cancelledUnarmed ->
    // armedCancelled`; read only under `armed -> drained` or
    // `armedCancelled -> cancelledDrained`. Those transition pairs never
    // overlap in time (each is a distinct winning CAS), so the write
    // happens-before the read without any additional synchronization
    // beyond the state CAS itself.
    waker: UnsafeCell<Option<Waker>>,
}

// SAFETY: all access to `waker` is gated by a successful CAS on `state`,
// which is the actual synchronization point; only one thread ever holds the
// right to read or write the cell at a time.
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Waiter {
    /// A fresh, unarmed, uncancelled waiter.
    pub fn new() -> Waiter {
        Waiter {
            state: AtomicU8::new(0),
            waker: UnsafeCell::new(None),
        }
    }

    /// The current state, for diagnostics and tests. Not meant to drive
    /// control flow by itself — prefer `arm`/`cancel`/`take_for_resume`,
    /// which are the only operations that actually transition the state.
    pub fn state(&self) -> State {
        State::from_bits(self.state.load(Ordering::Acquire))
    }

    /// Install `waker` as this waiter's continuation.
    ///
    /// Returns `Ok(())` on a normal `unarmed -> armed` transition. Returns
    /// `Err(AlreadyCancelled)` if a `cancel` had already landed
    /// (`cancelledUnarmed -> armedCancelled`) — the caller must then resume
    /// immediately with a cancellation outcome rather than waiting for a
    /// drain that will never look at this waiter's continuation again,
    /// because `take_for_resume` only transitions out of `armed`/
    /// `armedCancelled`, never re-reads an already-terminal state.
    ///
    /// # Panics
    ///
    /// Panics if called while already armed or drained — a second `arm` on
    /// the same waiter is a programming error.
    pub fn arm(&self, waker: Waker) -> Result<(), AlreadyCancelled> {
        match self
            .state
            .compare_exchange(0, ARMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: we just won the `unarmed -> armed` CAS; we are the
                // only writer and no reader can observe this slot until a
                // later `armed -> drained` CAS succeeds.
                unsafe { *self.waker.get() = Some(waker) };
                Ok(())
            }
            Err(CANCELLED) => {
                match self.state.compare_exchange(
                    CANCELLED,
                    ARMED | CANCELLED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => Err(AlreadyCancelled),
                    Err(bits) => panic!(
                        "Waiter::arm raced with an unexpected transition out of \
                         cancelledUnarmed: {:?}",
                        State::from_bits(bits)
                    ),
                }
            }
            Err(bits) => panic!(
                "Waiter::arm called twice (current state: {:?})",
                State::from_bits(bits)
            ),
        }
    }

    /// Flip the cancellation bit. Never resumes anything directly — only
    /// [`Waiter::take_for_resume`] does that. Idempotent: cancelling an
    /// already-cancelled or already-drained waiter is a no-op.
    pub fn cancel(&self) {
        loop {
            let bits = self.state.load(Ordering::Acquire);
            if bits & CANCELLED != 0 || bits & DRAINED != 0 {
                return; // already cancelled, or already resumed: nothing to do.
            }
            let next = bits | CANCELLED;
            if self
                .state
                .compare_exchange(bits, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Attempt to take ownership of the continuation for resumption.
    ///
    /// Returns `Some((waker, was_cancelled))` to exactly one caller — the
    /// one whose CAS wins the `armed -> drained` or `armedCancelled ->
    /// cancelledDrained` transition. Every other call (concurrent loser, or
    /// a waiter that was never armed, or one that's already terminal)
    /// returns `None`.
    pub fn take_for_resume(&self) -> Option<(Waker, bool)> {
        loop {
            let bits = self.state.load(Ordering::Acquire);
            let (from, to, was_cancelled) = match bits {
                ARMED => (ARMED, ARMED | DRAINED, false),
                x if x == ARMED | CANCELLED => {
                    (ARMED | CANCELLED, ARMED | CANCELLED | DRAINED, true)
                }
                _ => return None, // unarmed, cancelledUnarmed, or already terminal.
            };
            if self
                .state
                .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: we just won the CAS into a `drained` terminal
                // state; the writer side (`arm`) happened-before this read
                // because it's the same atomic location and the write
                // happened under the `from` state we just transitioned out
                // of. No other thread can win this CAS (it's compare-and-
                // swap on an exact `from` value), so we have exclusive
                // access to the slot.
                let waker = unsafe { (*self.waker.get()).take() };
                return Some((
                    waker.expect("armed waiter must have a continuation installed"),
                    was_cancelled,
                ));
            }
        }
    }
}

impl Default for Waiter {
    fn default() -> Waiter {
        Waiter::new()
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").field("state", &self.state()).finish()
    }
}

/// Returned by [`Waiter::arm`] when the waiter was already cancelled before
/// the continuation could be installed. The caller must resume immediately
/// with a cancellation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyCancelled;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::Wake;

    struct NoopWake;
    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWake))
    }

    #[test]
    fn arm_then_take_for_resume_success_path() {
        let w = Waiter::new();
        assert_eq!(w.state(), State::Unarmed);
        w.arm(noop_waker()).unwrap();
        assert_eq!(w.state(), State::Armed);
        let (_, cancelled) = w.take_for_resume().unwrap();
        assert!(!cancelled);
        assert_eq!(w.state(), State::Drained);
        assert!(w.take_for_resume().is_none(), "must resume exactly once");
    }

    #[test]
    fn cancel_before_arm_then_arm_observes_already_cancelled() {
        let w = Waiter::new();
        w.cancel();
        assert_eq!(w.state(), State::CancelledUnarmed);
        let err = w.arm(noop_waker()).unwrap_err();
        let _ = err;
        assert_eq!(w.state(), State::ArmedCancelled);
    }

    #[test]
    fn cancel_after_arm_then_take_for_resume_reports_cancelled() {
        let w = Waiter::new();
        w.arm(noop_waker()).unwrap();
        w.cancel();
        assert_eq!(w.state(), State::ArmedCancelled);
        let (_, cancelled) = w.take_for_resume().unwrap();
        assert!(cancelled);
        assert_eq!(w.state(), State::CancelledDrained);
    }

    #[test]
    fn cancel_is_idempotent_after_drain() {
        let w = Waiter::new();
        w.arm(noop_waker()).unwrap();
        w.take_for_resume().unwrap();
        w.cancel(); // must not panic or change the terminal state.
        assert_eq!(w.state(), State::Drained);
    }

    #[test]
    #[should_panic(expected = "Waiter::arm called twice")]
    fn double_arm_traps() {
        let w = Waiter::new();
        w.arm(noop_waker()).unwrap();
        let _ = w.arm(noop_waker());
    }

    #[test]
    fn concurrent_cancel_and_take_for_resume_only_one_resumption() {
        use std::thread;

        for _ in 0..200 {
            let w = Arc::new(Waiter::new());
            w.arm(noop_waker()).unwrap();

            let w1 = Arc::clone(&w);
            let t1 = thread::spawn(move || w1.cancel());
            let w2 = Arc::clone(&w);
            let t2 = thread::spawn(move || w2.take_for_resume());

            t1.join().unwrap();
            let resumed = t2.join().unwrap();
            assert!(w.state().is_terminal() || resumed.is_none());
        }
    }
}
