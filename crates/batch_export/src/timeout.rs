//! Monotonic deadlines shared across nested waits.
//!
//! Every blocking public operation takes an `Option<Duration>` where `None`
//! means "wait forever". A [`Deadline`] is computed once from that timeout and
//! handed down, so a shutdown that first joins the worker and then shuts down
//! the exporter never spends more than the caller's total budget.

use std::time::{Duration, Instant};

/// A point on the monotonic clock, or no limit at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Deadline `timeout` from now; `None` never expires.
    pub fn after(timeout: Option<Duration>) -> Self {
        let at = timeout.and_then(|t| Instant::now().checked_add(t));
        Self { at }
    }

    pub fn never() -> Self {
        Self { at: None }
    }

    /// Remaining budget; `None` when unbounded, `Some(ZERO)` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| at <= Instant::now())
    }

    /// True if waiting `delay` from now would reach or pass the deadline.
    pub fn would_pass(&self, delay: Duration) -> bool {
        match self.at {
            None => false,
            Some(at) => Instant::now()
                .checked_add(delay)
                .map_or(true, |wake| wake >= at),
        }
    }

    /// Length of the next wait slice: the remaining budget capped at `max`.
    pub fn slice(&self, max: Duration) -> Duration {
        self.remaining().map_or(max, |r| r.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_deadline_never_expires() {
        let d = Deadline::after(None);
        assert_eq!(d, Deadline::never());
        assert!(!d.is_expired());
        assert_eq!(d.remaining(), None);
        assert!(!d.would_pass(Duration::from_secs(3600)));
        assert_eq!(d.slice(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_timeout_is_already_expired() {
        let d = Deadline::after(Some(Duration::ZERO));
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
        assert_eq!(d.slice(Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_remaining_shrinks_and_caps_slices() {
        let d = Deadline::after(Some(Duration::from_secs(10)));
        let remaining = d.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
        assert_eq!(d.slice(Duration::from_millis(5)), Duration::from_millis(5));
        assert!(d.would_pass(Duration::from_secs(11)));
        assert!(!d.would_pass(Duration::from_secs(1)));
    }

    #[test]
    fn test_huge_timeout_saturates_to_unbounded() {
        let d = Deadline::after(Some(Duration::MAX));
        assert_eq!(d.remaining(), None);
    }
}
