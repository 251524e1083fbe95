//! [`WaiterQueue`]: a fixed-capacity FIFO of registered/armed waiters with
//! O(1) eager cancellation.
//!
//! Generic over the continuation payload `T` so [`crate::handle_pool`] can
//! store `Arc<crate::waiter::Waiter>` handles here while
//! [`crate::completion_queue`] (which doesn't need this structure directly)
//! stays decoupled from it. The slab-of-slots design follows
//! `compio_driver::Key<T>` (`other_examples/manifests/compio-rs-compio`):
//! entries live in a `slab::Slab`, addressed by a small integer key, with a
//! separate monotonic generation counter per slot to make stale tickets
//! safely detectable instead of silently aliasing a reused key (the classic
//! slot-map ABA hazard).

use std::collections::VecDeque;

use slab::Slab;

/// Opaque identity of a reservation. `Copy` because unlike [`crate::operation::Operation`]
/// there is no ownership to transfer — holding a `TicketId` conveys no
/// exclusive rights, only the ability to ask the queue "do you still know
/// about this one".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId {
    key: usize,
    generation: u64,
}

enum Slot<T> {
    Reserved,
    Armed(T),
}

/// A fixed-capacity FIFO queue implementing the two-phase register/arm
/// reservation protocol.
///
/// ```text
/// register() -> TicketId           // reserve a slot, no continuation yet
/// arm(ticket, cont) -> Result<(), ArmRejection>   // bind the continuation
/// abandon(ticket)                  // give up before arming
/// cancel(ticket) -> Option<T>      // eagerly evict, return cont if armed
/// dequeue() -> Option<(TicketId, T)>   // FIFO pop of an armed waiter
/// close_and_drain() -> Vec<(TicketId, T)>
/// ```
///
/// Cancellation never leaves a tombstone: `cancel` removes the slab entry
/// immediately regardless of whether it was `Reserved` or `Armed`, so
/// capacity is reclaimed the instant cancellation is observed, not when the
/// entry would otherwise have been dequeued.
pub struct WaiterQueue<T> {
    capacity: usize,
    slots: Slab<(u64, Slot<T>)>,
    order: VecDeque<usize>,
    next_generation: u64,
    closed: bool,
}

/// Returned by [`WaiterQueue::register`] when no reservation could be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRejection {
    /// The queue is already at `capacity`.
    Full,
    /// [`WaiterQueue::close_and_drain`] has already run.
    Closed,
}

/// Returned by [`WaiterQueue::arm`] when the ticket can't be armed normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRejection {
    /// `cancel` (or `close_and_drain`) ran on this ticket before `arm` did.
    /// The caller must resume its continuation immediately with a
    /// cancellation outcome — nothing will ever dequeue it.
    AlreadyCancelled,
}

impl<T> WaiterQueue<T> {
    /// A queue that accepts at most `capacity` concurrently-live tickets.
    pub fn with_capacity(capacity: usize) -> WaiterQueue<T> {
        WaiterQueue {
            capacity,
            slots: Slab::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            next_generation: 0,
            closed: false,
        }
    }

    /// Number of tickets currently reserved or armed.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Phase one: reserve a slot, with no continuation yet.
    pub fn register(&mut self) -> Result<TicketId, RegisterRejection> {
        if self.closed {
            return Err(RegisterRejection::Closed);
        }
        if self.slots.len() >= self.capacity {
            return Err(RegisterRejection::Full);
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let key = self.slots.insert((generation, Slot::Reserved));
        Ok(TicketId { key, generation })
    }

    /// Phase two: bind `continuation` to a previously registered ticket.
    ///
    /// # Panics
    ///
    /// Panics if `ticket` was already armed (arming twice is a programming
    /// error, same contract as [`crate::waiter::Waiter::arm`]).
    pub fn arm(&mut self, ticket: TicketId, continuation: T) -> Result<(), ArmRejection> {
        match self.slots.get_mut(ticket.key) {
            Some((gen, slot)) if *gen == ticket.generation => match slot {
                Slot::Reserved => {
                    *slot = Slot::Armed(continuation);
                    self.order.push_back(ticket.key);
                    Ok(())
                }
                Slot::Armed(_) => panic!("WaiterQueue::arm called twice for the same ticket"),
            },
            // Not found, or generation mismatch: a concurrent cancel (or a
            // close_and_drain) already evicted this ticket.
            _ => Err(ArmRejection::AlreadyCancelled),
        }
    }

    /// Give up on an unarmed ticket, e.g. a synchronous early return between
    /// `register` and `arm`. A no-op if the ticket was already evicted by a
    /// concurrent `cancel`.
    pub fn abandon(&mut self, ticket: TicketId) {
        if let Some((gen, Slot::Reserved)) = self.slots.get(ticket.key) {
            if *gen == ticket.generation {
                self.slots.remove(ticket.key);
            }
        }
    }

    /// Eagerly evict `ticket`, freeing its capacity immediately. Returns the
    /// continuation if the ticket had been armed, so the caller can resume
    /// it with a cancellation outcome; returns `None` if it was still only
    /// reserved (the pending `arm` call will discover the cancellation
    /// itself) or if it had already been dequeued/cancelled/closed.
    pub fn cancel(&mut self, ticket: TicketId) -> Option<T> {
        match self.slots.get(ticket.key) {
            Some((gen, _)) if *gen == ticket.generation => {
                let (_, slot) = self.slots.remove(ticket.key);
                match slot {
                    Slot::Armed(cont) => Some(cont),
                    Slot::Reserved => None,
                }
            }
            _ => None,
        }
    }

    /// Pop the next armed waiter in FIFO order. Skips (and drops) order
    /// entries whose slab slot is already gone — evicted by a concurrent
    /// `cancel` — exactly as `completion_queue::drain` skips stale events.
    pub fn dequeue(&mut self) -> Option<(TicketId, T)> {
        while let Some(key) = self.order.pop_front() {
            if !self.slots.contains(key) {
                continue; // cancelled since it was armed; stale, skip.
            }
            let (generation, slot) = self.slots.remove(key);
            match slot {
                Slot::Armed(cont) => return Some((TicketId { key, generation }, cont)),
                Slot::Reserved => {
                    unreachable!("order queue only ever holds keys for armed slots")
                }
            }
        }
        None
    }

    /// Close the queue to further `register` calls and drain every
    /// currently armed waiter, in FIFO order, for the caller to resume with
    /// whatever terminal outcome applies (shutdown, typically). Slots still
    /// only `Reserved` (a ticket whose `arm` hasn't landed yet) are left in
    /// place; their `arm` call will observe `closed` via
    /// [`ArmRejection::AlreadyCancelled`] and the original caller resumes
    /// itself.
    pub fn close_and_drain(&mut self) -> Vec<(TicketId, T)> {
        self.closed = true;
        let mut drained = Vec::with_capacity(self.order.len());
        while let Some((id, cont)) = self.dequeue() {
            drained.push((id, cont));
        }
        drained
    }

    /// `true` once [`WaiterQueue::close_and_drain`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `true` if `ticket` still identifies a live slot (reserved or armed),
    /// i.e. no `cancel`/`close_and_drain`/`dequeue` has touched it yet.
    pub fn contains(&self, ticket: TicketId) -> bool {
        matches!(self.slots.get(ticket.key), Some((gen, _)) if *gen == ticket.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_arm_dequeue_fifo_order() {
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(4);
        let t0 = q.register().unwrap();
        let t1 = q.register().unwrap();
        q.arm(t0, 100).unwrap();
        q.arm(t1, 101).unwrap();
        assert_eq!(q.dequeue().unwrap().1, 100);
        assert_eq!(q.dequeue().unwrap().1, 101);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn capacity_is_enforced_and_freed_by_cancel() {
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(2);
        let t0 = q.register().unwrap();
        let _t1 = q.register().unwrap();
        assert_eq!(q.register().unwrap_err(), RegisterRejection::Full);
        q.cancel(t0);
        // Freed immediately — no tombstone occupying the slot.
        q.register().unwrap();
    }

    #[test]
    fn cancel_before_arm_reports_already_cancelled() {
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(2);
        let t0 = q.register().unwrap();
        assert!(q.cancel(t0).is_none()); // nothing armed yet to hand back
        assert_eq!(q.arm(t0, 42).unwrap_err(), ArmRejection::AlreadyCancelled);
    }

    #[test]
    fn cancel_after_arm_returns_continuation_and_frees_slot() {
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(2);
        let t0 = q.register().unwrap();
        q.arm(t0, 7).unwrap();
        assert_eq!(q.cancel(t0), Some(7));
        assert!(q.is_empty());
    }

    #[test]
    fn abandon_frees_an_unarmed_slot() {
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(1);
        let t0 = q.register().unwrap();
        q.abandon(t0);
        assert!(q.is_empty());
        q.register().unwrap();
    }

    #[test]
    fn stale_ticket_id_after_slot_reuse_is_rejected() {
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(1);
        let t0 = q.register().unwrap();
        q.cancel(t0);
        let t1 = q.register().unwrap();
        assert_eq!(t0.key, t1.key); // slab key reused...
        assert_ne!(t0.generation, t1.generation); // ...but generation differs.
        assert_eq!(q.arm(t0, 1).unwrap_err(), ArmRejection::AlreadyCancelled);
        q.arm(t1, 2).unwrap();
    }

    #[test]
    fn close_and_drain_returns_armed_waiters_and_blocks_new_registration() {
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(4);
        let t0 = q.register().unwrap();
        let t1 = q.register().unwrap();
        q.arm(t0, 1).unwrap();
        q.arm(t1, 2).unwrap();
        let drained = q.close_and_drain();
        assert_eq!(drained.iter().map(|(_, c)| *c).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            q.register().unwrap_err(),
            RegisterRejection::Closed
        );
    }

    #[test]
    fn capacity_stress_after_mass_cancel() {
        let k = 10;
        let mut q: WaiterQueue<u32> = WaiterQueue::with_capacity(k);
        let tickets: Vec<_> = (0..k).map(|_| q.register().unwrap()).collect();
        for t in tickets {
            q.cancel(t);
        }
        for _ in 0..k {
            q.register().unwrap();
        }
    }
}
