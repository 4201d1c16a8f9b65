//! Exponential backoff with uniform jitter for reconnect delays.
//!
//! `delay(n) = clamp(initial * 2^n, initial, max)`, then ±25% uniform
//! jitter is applied and the result clamped to `[0, max]` (P6).

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn default_link() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    fn base_delay(&self, retries: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(retries.min(32));
        let scaled = self.initial.saturating_mul(multiplier as u32);
        scaled.min(self.max)
    }

    /// Computes the jittered delay for the given retry count using `rng`.
    pub fn delay_with_rng(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(retries);
        let jitter_fraction = rng.gen_range(-0.25..=0.25);
        let jittered_secs = base.as_secs_f64() * (1.0 + jitter_fraction);
        let clamped = jittered_secs.max(0.0).min(self.max.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    pub fn delay(&self, retries: u32) -> Duration {
        self.delay_with_rng(retries, &mut rand::thread_rng())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// P6: whatever the retry count or jitter roll, the delay never
        /// leaves `[0, max]`.
        #[test]
        fn delay_stays_within_bounds(retries in 0u32..1000, seed in any::<u64>()) {
            let policy = BackoffPolicy::default_link();
            let mut rng = StepRng::new(seed, 1);
            let d = policy.delay_with_rng(retries, &mut rng);
            prop_assert!(d <= policy.max);
            prop_assert!(d >= Duration::ZERO);
        }

        /// P6: away from the cap, jitter never moves the delay more than
        /// 25% from its unjittered base.
        #[test]
        fn jitter_stays_within_twenty_five_percent_when_uncapped(retries in 0u32..10, seed in any::<u64>()) {
            let policy = BackoffPolicy::default_link();
            let base = policy.base_delay(retries).as_secs_f64();
            prop_assume!(base < policy.max.as_secs_f64());

            let mut rng = StepRng::new(seed, 1);
            let jittered = policy.delay_with_rng(retries, &mut rng).as_secs_f64();
            prop_assert!((jittered - base).abs() <= 0.25 * base + 1e-9);
        }
    }
}
