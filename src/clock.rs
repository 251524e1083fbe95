//! [`Deadline`]: a monotonic point in time used to bound a blocking
//! syscall. Timing and monotonic clocks are otherwise out of scope for
//! this crate; this thin wrapper over [`std::time::Instant`] is the
//! minimal interface the poll loop and backends need to turn an absolute
//! deadline into a relative timeout.

use std::time::{Duration, Instant};

/// An absolute point in time, expressed against the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `from_now` in the future.
    pub fn after(from_now: Duration) -> Deadline {
        Deadline(Instant::now() + from_now)
    }

    /// A deadline at the given instant.
    pub fn at(instant: Instant) -> Deadline {
        Deadline(instant)
    }

    /// Time remaining until this deadline, or `Duration::ZERO` if it has
    /// already elapsed. Never negative — backends pass this straight into
    /// a blocking poll call that takes an unsigned timeout.
    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// `true` once [`Deadline::remaining`] would return zero.
    pub fn has_elapsed(self) -> bool {
        Instant::now() >= self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_has_nonzero_remaining() {
        let d = Deadline::after(Duration::from_secs(10));
        assert!(d.remaining() > Duration::from_secs(1));
        assert!(!d.has_elapsed());
    }

    #[test]
    fn past_deadline_has_elapsed_and_zero_remaining() {
        let d = Deadline::at(Instant::now() - Duration::from_secs(1));
        assert!(d.has_elapsed());
        assert_eq!(d.remaining(), Duration::ZERO);
    }
}
