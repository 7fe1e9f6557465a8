//! Retry policy and backoff arithmetic.

use std::time::Duration;

use rand::Rng;

/// How a [`super::RetryExecutor`] spaces and bounds its attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Multiply each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt `attempt` (1-based), without
    /// jitter: `min(max_delay, base_delay * exponential_base^(attempt-1))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.exponential_base.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Backoff for `attempt` with jitter applied when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter {
            apply_jitter(delay, rand::thread_rng().gen_range(0.5..=1.5))
        } else {
            delay
        }
    }

    /// Attempts actually made per call; a policy never makes fewer than one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Scale `delay` by `factor`, clamped to the jitter range.
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    delay.mul_f64(factor.clamp(0.5, 1.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = policy();
        let delays: Vec<u64> = (1..=6).map(|n| policy.backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_backoff_non_decreasing_until_capped() {
        let policy = RetryPolicy {
            exponential_base: 1.5,
            base_delay: Duration::from_millis(200),
            ..policy()
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(previous, policy.max_delay);
    }

    #[test]
    fn test_backoff_huge_attempt_is_capped() {
        assert_eq!(policy().backoff_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..100 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
        assert_eq!(apply_jitter(Duration::from_secs(2), 9.0), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_base_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy()
        };
        assert_eq!(policy.backoff_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_attempts_floor() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        assert_eq!(policy.attempts(), 1);
    }
}
