//! Exponential backoff with full jitter.
//!
//! Used both for rate-limit waits inside a run and for rescheduling a job
//! after repeated transient failures. Jitter keeps a fleet of jobs that
//! failed on the same upstream outage from retrying in lockstep.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Deterministic delay ceiling for the given attempt: `base * 2^attempt`,
    /// capped.
    pub fn max_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(32);
        let uncapped = self
            .base
            .saturating_mul(2u32.saturating_pow(exp));
        uncapped.min(self.cap)
    }

    /// Jittered delay: a random point in [max/2, max].
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay(attempt);
        let factor = 0.5 + fastrand::f64() * 0.5;
        max.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_ceiling_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.max_delay(0), Duration::from_secs(1));
        assert_eq!(policy.max_delay(1), Duration::from_secs(2));
        assert_eq!(policy.max_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.max_delay(10), Duration::from_secs(60));
        assert_eq!(policy.max_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
        for attempt in 0..8 {
            let max = policy.max_delay(attempt);
            for _ in 0..50 {
                let d = policy.delay(attempt);
                assert!(d <= max);
                assert!(d >= max / 2);
            }
        }
    }
}
