//! Retry backoff policies.
//!
//! Pure computation, no I/O: given an attempt number and policy parameters,
//! produce the delay before the next attempt and decide whether a retry is
//! allowed at all. All randomness comes through [`JitterSource`] so tests can
//! pin delays exactly.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use dwell_core::ErrorClass;

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay: `base_delay` every time.
    Linear,
    /// Constant delay plus uniform jitter in `[0, jitter_bound]`.
    LinearJitter,
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    Exponential,
    /// Capped exponential plus uniform jitter in `[0, jitter_bound]`.
    ExponentialJitter,
}

/// Retry policy configuration.
///
/// `max_attempts` counts executions, not retries: a policy with
/// `max_attempts = 3` runs the operation at most three times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper cap applied to the exponential family.
    pub max_delay: Duration,
    /// Width of the uniform jitter window for the jittered kinds.
    pub jitter_bound: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::default_exponential()
    }
}

impl BackoffPolicy {
    /// Stock linear policy: 5 attempts, 7.5 s apart.
    ///
    /// The presets carry the platform's historical defaults; fields are
    /// public, so call sites override via struct update when a handler needs
    /// different settings.
    pub fn default_linear() -> Self {
        Self::linear(5, Duration::from_millis(7500))
    }

    /// Stock linear-jitter policy: 2 attempts, 5 s plus up to 1 s of jitter.
    pub fn default_linear_jitter() -> Self {
        Self::linear_jitter(2, Duration::from_millis(5000), Duration::from_millis(1000))
    }

    /// Stock exponential policy: 3 attempts, base 7.5 s, doubling, capped at
    /// a minute.
    pub fn default_exponential() -> Self {
        Self::exponential(3, Duration::from_millis(7500), Duration::from_secs(60))
    }

    /// Constant delay between attempts.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            max_attempts,
            base_delay,
            max_delay: base_delay,
            jitter_bound: Duration::ZERO,
        }
    }

    /// Constant delay with uniform jitter, to spread out synchronized clients.
    pub fn linear_jitter(max_attempts: u32, base_delay: Duration, jitter_bound: Duration) -> Self {
        Self {
            kind: BackoffKind::LinearJitter,
            max_attempts,
            base_delay,
            max_delay: base_delay + jitter_bound,
            jitter_bound,
        }
    }

    /// Doubling delay, capped at `max_delay`.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            max_attempts,
            base_delay,
            max_delay,
            jitter_bound: Duration::ZERO,
        }
    }

    /// Capped doubling delay with uniform jitter.
    pub fn exponential_jitter(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_bound: Duration,
    ) -> Self {
        Self {
            kind: BackoffKind::ExponentialJitter,
            max_attempts,
            base_delay,
            max_delay,
            jitter_bound,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    ///
    /// `delay_for_attempt(1)` is the pause after the first failed execution.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.kind {
            BackoffKind::Linear => self.base_delay,
            BackoffKind::LinearJitter => self.base_delay + jitter.sample(self.jitter_bound),
            BackoffKind::Exponential => self.exponential_delay(attempt),
            BackoffKind::ExponentialJitter => {
                let delay = self.exponential_delay(attempt) + jitter.sample(self.jitter_bound);
                delay.min(self.max_delay)
            }
        }
    }

    /// Whether another attempt is allowed after `attempt` failed with an
    /// error of class `class`.
    ///
    /// Permanent failures never retry, regardless of remaining attempts.
    pub fn should_retry(&self, attempt: u32, class: ErrorClass) -> bool {
        class == ErrorClass::Transient && attempt < self.max_attempts
    }

    fn exponential_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.max_delay)
    }
}

/// Source of uniform jitter in `[0, bound]`.
pub trait JitterSource: Send + Sync {
    fn sample(&self, bound: Duration) -> Duration;
}

/// Thread-local RNG jitter for production use.
#[derive(Debug, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self, bound: Duration) -> Duration {
        if bound.is_zero() {
            return Duration::ZERO;
        }
        let bound_ms = bound.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound_ms))
    }
}

/// Zero jitter, for tests that assert exact delays.
#[derive(Debug, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn sample(&self, _bound: Duration) -> Duration {
        Duration::ZERO
    }
}

/// Constant jitter clamped to the bound, for deterministic jitter tests.
#[derive(Debug)]
pub struct FixedJitter(pub Duration);

impl JitterSource for FixedJitter {
    fn sample(&self, bound: Duration) -> Duration {
        self.0.min(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn linear_delay_is_constant() {
        let policy = BackoffPolicy::linear(5, Duration::from_millis(7500));
        for attempt in 1..=5 {
            assert_eq!(
                policy.delay_for_attempt(attempt, &NoJitter),
                Duration::from_millis(7500)
            );
        }
    }

    #[test]
    fn linear_jitter_adds_bounded_noise() {
        let policy =
            BackoffPolicy::linear_jitter(2, Duration::from_millis(5000), Duration::from_millis(1000));

        let fixed = policy.delay_for_attempt(1, &FixedJitter(Duration::from_millis(250)));
        assert_eq!(fixed, Duration::from_millis(5250));

        for _ in 0..100 {
            let sampled = policy.delay_for_attempt(1, &ThreadRngJitter);
            assert!(sampled >= Duration::from_millis(5000));
            assert!(sampled <= Duration::from_millis(6000));
        }
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy =
            BackoffPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1, &NoJitter), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, &NoJitter), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, &NoJitter), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4, &NoJitter), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(5, &NoJitter), Duration::from_millis(500));
    }

    #[test]
    fn exponential_jitter_respects_cap() {
        let policy = BackoffPolicy::exponential_jitter(
            5,
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(50),
        );

        assert_eq!(
            policy.delay_for_attempt(1, &FixedJitter(Duration::from_millis(50))),
            Duration::from_millis(150)
        );
        // 400ms raw exponential caps to 300ms before and after jitter.
        assert_eq!(
            policy.delay_for_attempt(3, &FixedJitter(Duration::from_millis(50))),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn should_retry_requires_transient_and_remaining_attempts() {
        let policy = BackoffPolicy::linear(3, Duration::from_millis(10));

        assert!(policy.should_retry(1, ErrorClass::Transient));
        assert!(policy.should_retry(2, ErrorClass::Transient));
        assert!(!policy.should_retry(3, ErrorClass::Transient));
        assert!(!policy.should_retry(1, ErrorClass::Permanent));
    }

    #[test]
    fn presets_carry_the_stock_defaults() {
        let linear = BackoffPolicy::default_linear();
        assert_eq!(linear.kind, BackoffKind::Linear);
        assert_eq!(linear.max_attempts, 5);
        assert_eq!(linear.base_delay, Duration::from_millis(7500));

        let jittered = BackoffPolicy::default_linear_jitter();
        assert_eq!(jittered.kind, BackoffKind::LinearJitter);
        assert_eq!(jittered.max_attempts, 2);
        assert_eq!(jittered.base_delay, Duration::from_millis(5000));
        assert_eq!(jittered.jitter_bound, Duration::from_millis(1000));

        let exponential = BackoffPolicy::default_exponential();
        assert_eq!(exponential.kind, BackoffKind::Exponential);
        assert_eq!(exponential.max_attempts, 3);
        assert_eq!(exponential.base_delay, Duration::from_millis(7500));
        assert_eq!(exponential.max_delay, Duration::from_secs(60));

        // Presets stay overridable via struct update.
        let tweaked = BackoffPolicy {
            max_attempts: 8,
            ..BackoffPolicy::default_linear()
        };
        assert_eq!(tweaked.max_attempts, 8);
        assert_eq!(tweaked.base_delay, Duration::from_millis(7500));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0, &NoJitter), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn exponential_is_monotonic_without_jitter(
            base_ms in 1u64..10_000,
            max_ms in 1u64..3_600_000,
            attempt in 1u32..30,
        ) {
            let policy = BackoffPolicy::exponential(
                u32::MAX,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            );
            let current = policy.delay_for_attempt(attempt, &NoJitter);
            let next = policy.delay_for_attempt(attempt + 1, &NoJitter);
            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_millis(max_ms));
        }

        #[test]
        fn permanent_errors_never_retry(attempt in 0u32..100, max in 0u32..100) {
            let policy = BackoffPolicy::linear(max, Duration::from_millis(1));
            prop_assert!(!policy.should_retry(attempt, ErrorClass::Permanent));
        }

        #[test]
        fn jittered_delay_stays_within_window(
            base_ms in 1u64..10_000,
            jitter_ms in 0u64..5_000,
            attempt in 1u32..10,
        ) {
            let policy = BackoffPolicy::linear_jitter(
                5,
                Duration::from_millis(base_ms),
                Duration::from_millis(jitter_ms),
            );
            let delay = policy.delay_for_attempt(attempt, &ThreadRngJitter);
            prop_assert!(delay >= Duration::from_millis(base_ms));
            prop_assert!(delay <= Duration::from_millis(base_ms + jitter_ms));
        }
    }
}
