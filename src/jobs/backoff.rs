//! Retry policy with capped exponential backoff
//!
//! - Nominal delay: `min(max_delay, base * multiplier^attempt)`
//! - Jitter: ±`jitter` fraction of the nominal delay, clamped to `[0, max_delay]`
//! - A job whose attempt count reaches `max_attempts` is failed, never retried

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum transient failures before a job is FAILED
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (5 seconds)
const BASE_DELAY_MS: u64 = 5_000;

/// Maximum delay cap (5 minutes)
const MAX_DELAY_MS: u64 = 300_000;

const MAX_EXPONENT: i32 = 62;

/// What to do after a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted
    GiveUp { attempt: u32 },
}

/// Backoff settings shared by every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the nominal delay used as jitter amplitude (0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, for deterministic schedules
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry for a job that has already failed `attempt` times
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX).min(MAX_EXPONENT);
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let exponential = self.base_delay_ms as f64 * multiplier.powi(exponent);

        let delay_ms = if exponential.is_finite() {
            (exponential as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };

        Duration::from_millis(delay_ms)
    }

    /// Nominal delay with random jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as f64;
        if self.jitter <= 0.0 || nominal == 0.0 {
            return Duration::from_millis(nominal as u64);
        }

        let amplitude = nominal * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-amplitude..=amplitude);
        let jittered = (nominal + offset).clamp(0.0, self.max_delay_ms as f64);

        Duration::from_millis(jittered as u64)
    }

    /// Decide the fate of a job that just failed transiently having
    /// previously failed `prior_attempts` times
    pub fn decide(&self, prior_attempts: u32) -> RetryDecision {
        let attempt = prior_attempts.saturating_add(1);
        if attempt >= self.max_attempts {
            RetryDecision::GiveUp { attempt }
        } else {
            RetryDecision::Retry {
                attempt,
                delay: self.delay(prior_attempts),
            }
        }
    }

    /// Upper bound on the total time spent waiting between retries
    pub fn max_total_wait_time(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.nominal_delay(attempt))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn fixed_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 16000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_nominal_delay() {
        let policy = fixed_policy();

        assert_eq!(policy.nominal_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(8000));
        assert_eq!(policy.nominal_delay(4), Duration::from_millis(16000));
    }

    #[test]
    fn test_delay_cap() {
        let policy = fixed_policy();
        assert_eq!(policy.nominal_delay(10), Duration::from_millis(16000));
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_millis(16000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            jitter: 0.25,
            ..fixed_policy()
        };
        for _ in 0..200 {
            let delay = policy.delay(1).as_millis();
            assert!((1500..=2500).contains(&delay), "delay {delay} out of range");
        }
        for _ in 0..200 {
            assert!(policy.delay(20) <= Duration::from_millis(16000));
        }
    }

    #[test]
    fn test_decide_gives_up_at_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..fixed_policy()
        };

        assert_eq!(
            policy.decide(0),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(policy.decide(2), RetryDecision::GiveUp { attempt: 3 });
        assert_eq!(policy.decide(7), RetryDecision::GiveUp { attempt: 8 });
    }

    #[test]
    fn test_max_total_wait_time() {
        let policy = fixed_policy();
        // 1s + 2s + 4s + 8s between five attempts
        assert_eq!(policy.max_total_wait_time(), Duration::from_secs(15));
    }

    #[test]
    fn test_degenerate_multiplier() {
        let policy = RetryPolicy {
            multiplier: f64::NAN,
            ..fixed_policy()
        };
        assert_eq!(policy.nominal_delay(5), Duration::from_millis(1000));
    }

    #[quickcheck]
    fn prop_nominal_delay_is_monotonic(attempt: u8, base: u16, cap: u32) -> bool {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: u64::from(base),
            max_delay_ms: u64::from(base) + u64::from(cap),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let attempt = u32::from(attempt);
        let current = policy.nominal_delay(attempt);
        let next = policy.nominal_delay(attempt + 1);
        current <= next && next <= Duration::from_millis(policy.max_delay_ms)
    }

    #[quickcheck]
    fn prop_exhausted_attempts_never_retry(prior: u8, max_attempts: u8) -> bool {
        let policy = RetryPolicy {
            max_attempts: u32::from(max_attempts),
            ..fixed_policy()
        };
        match policy.decide(u32::from(prior)) {
            RetryDecision::GiveUp { attempt } => attempt >= policy.max_attempts,
            RetryDecision::Retry { attempt, .. } => attempt < policy.max_attempts,
        }
    }
}
