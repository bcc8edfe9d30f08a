//! Backoff policy for requeued reconciliations.
//!
//! The delay depends only on how long the object has been waiting since its
//! first notification: it starts at `initial_delay` and doubles once per
//! elapsed `doubling_window`, capped at `max_delay`. Being a pure function of
//! elapsed time it is monotonically non-decreasing and bounded, and two
//! controllers looking at the same notification always agree on the delay.

use std::time::Duration;

/// Requeue backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    /// Delay applied while the object is within its first doubling window.
    pub initial_delay: Duration,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,
    /// Elapsed time after which the delay doubles again.
    pub doubling_window: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            doubling_window: Duration::from_secs(30),
        }
    }
}

impl RequeuePolicy {
    /// Delay for an object that has been waiting for `elapsed`.
    #[must_use]
    pub fn delay_for_elapsed(&self, elapsed: Duration) -> Duration {
        let ceiling = self.max_delay.max(self.initial_delay);
        let window = self.doubling_window.as_millis().max(1);
        let doublings = elapsed.as_millis() / window;

        // 2^31 already exceeds any sane ceiling; clamping keeps the shift defined.
        let shift = u32::try_from(doublings.min(31)).unwrap_or(31);
        self.initial_delay
            .checked_mul(1_u32 << shift)
            .map_or(ceiling, |delay| delay.min(ceiling))
    }

    /// Delay for an object first seen at `first_seen_ms`, evaluated at `now_ms`.
    ///
    /// A `first_seen_ms` in the future (clock skew between controllers) is
    /// treated as zero elapsed time.
    #[must_use]
    pub fn next_delay(&self, first_seen_ms: u64, now_ms: u64) -> Duration {
        self.delay_for_elapsed(Duration::from_millis(now_ms.saturating_sub(first_seen_ms)))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn policy() -> RequeuePolicy {
        RequeuePolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            doubling_window: Duration::from_secs(30),
        }
    }

    #[test]
    fn first_window_uses_initial_delay() {
        let p = policy();
        assert_eq!(p.delay_for_elapsed(Duration::ZERO), Duration::from_secs(5));
        assert_eq!(p.delay_for_elapsed(Duration::from_secs(29)), Duration::from_secs(5));
    }

    #[test]
    fn delay_doubles_per_window() {
        let p = policy();
        assert_eq!(p.delay_for_elapsed(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(p.delay_for_elapsed(Duration::from_secs(60)), Duration::from_secs(20));
        assert_eq!(p.delay_for_elapsed(Duration::from_secs(90)), Duration::from_secs(40));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for_elapsed(Duration::from_secs(120)), Duration::from_secs(60));
        assert_eq!(
            p.delay_for_elapsed(Duration::from_secs(u64::from(u32::MAX))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn next_delay_uses_wall_clock_difference() {
        let p = policy();
        let first_seen = 1_700_000_000_000;
        assert_eq!(p.next_delay(first_seen, first_seen + 61_000), Duration::from_secs(20));
    }

    #[test]
    fn future_first_seen_is_zero_elapsed() {
        let p = policy();
        assert_eq!(p.next_delay(10_000, 5_000), Duration::from_secs(5));
    }

    #[test]
    fn zero_window_does_not_divide_by_zero() {
        let p = RequeuePolicy {
            doubling_window: Duration::ZERO,
            ..policy()
        };
        assert_eq!(p.delay_for_elapsed(Duration::from_secs(1)), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_bounded(a in 0_u64..10_000_000, b in 0_u64..10_000_000) {
            let p = RequeuePolicy::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let d_lo = p.delay_for_elapsed(Duration::from_millis(lo));
            let d_hi = p.delay_for_elapsed(Duration::from_millis(hi));

            prop_assert!(d_lo <= d_hi);
            prop_assert!(d_hi <= p.max_delay);
            prop_assert!(d_lo >= p.initial_delay);
        }
    }
}
