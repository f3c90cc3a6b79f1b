//! Retry delay calculation with exponential backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest jitter fraction the policy accepts (±20%).
const MAX_JITTER: f64 = 0.2;

/// Backoff policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Maximum delay cap
    pub ceiling: Duration,
    /// Random spread applied by `jittered_delay`, as a fraction of the delay
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            jitter: 0.0,
        }
    }

    /// Enable bounded jitter. Values above 0.2 are clamped.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, MAX_JITTER);
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `base * 2^(attempt - 1)`, capped at `ceiling`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    /// `delay(attempt)` spread by up to ±`jitter`, still capped at `ceiling`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }

        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor).min(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.ceiling, Duration::from_secs(60));
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_exponential_growth() {
        let policy = BackoffPolicy::default();

        let delays: Vec<u64> = (1..=6).map(|i| policy.delay(i).as_secs()).collect();

        // 1, 2, 4, 8, 16, 32
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_delay_cap_at_ceiling() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(100), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_custom_policy() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_is_clamped() {
        let policy = BackoffPolicy::default().with_jitter(0.9);
        assert_eq!(policy.jitter, 0.2);
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let policy = BackoffPolicy::default().with_jitter(0.2);
        let mut rng = rand::thread_rng();

        for _ in 0..100 {
            let delay = policy.jittered_delay(3, &mut rng);
            assert!(delay >= Duration::from_secs_f64(3.19));
            assert!(delay <= Duration::from_secs_f64(4.81));
        }
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic_and_capped(
            base_ms in 1u64..5_000,
            ceiling_ms in 1u64..600_000,
            attempt in 1u32..64,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(ceiling_ms),
            );

            let current = policy.delay(attempt);
            let next = policy.delay(attempt + 1);

            prop_assert!(next >= current);
            prop_assert!(next <= policy.ceiling);
        }
    }
}
