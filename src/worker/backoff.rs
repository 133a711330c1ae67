//! Retry delay and poll jitter.

use rand::Rng;
use std::time::Duration;

/// Exponential retry backoff with random jitter and a hard cap.
///
/// The delay after the `n`th failed attempt is `base * 2^(n-1)`, plus up to
/// `jitter` of itself at random, never more than `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the base delay added at random. 0 disables jitter.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.25,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Delay after `attempt` failures, without jitter. Non-decreasing in
    /// `attempt` and bounded by `cap`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap)
    }

    /// Delay after `attempt` failures, with jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(rand::rng().random_range(0.0..self.jitter));
        (delay + extra).min(self.cap)
    }
}

/// `interval` plus up to `fraction` of itself, so idle runners sharing a
/// store don't poll in lockstep.
pub fn jittered(interval: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || interval.is_zero() {
        return interval;
    }
    interval + interval.mul_f64(rand::rng().random_range(0.0..fraction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delays_double_then_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u128> = (1..=6).map(|n| policy.base_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn base_delays_are_non_decreasing() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(60));
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= policy.cap);
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.5);
        for _ in 0..200 {
            let delay = policy.delay(3);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay < Duration::from_millis(600));
        }
    }

    #[test]
    fn jittered_delay_never_exceeds_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(150));
        for _ in 0..200 {
            assert!(policy.delay(10) <= Duration::from_millis(150));
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), policy.cap);
    }

    #[test]
    fn poll_jitter_adds_at_most_the_fraction() {
        let interval = Duration::from_millis(1000);
        for _ in 0..200 {
            let wait = jittered(interval, 0.2);
            assert!(wait >= interval && wait < Duration::from_millis(1200));
        }
        assert_eq!(jittered(interval, 0.0), interval);
    }
}
