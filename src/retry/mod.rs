//! Classified retry with exponential backoff and a circuit breaker.
//!
//! [`RetryExecutor::execute_with_retry`] runs an attempt closure up to
//! [`RetryPolicy::attempts`] times. Permanent failures are returned at once,
//! retryable ones are retried after a backoff delay, and every attempt is
//! first admitted by the executor's [`CircuitBreaker`]. While the breaker is
//! open the backend is not contacted at all and the call fails fast with
//! [`GenerationError::CircuitOpen`].

mod circuit;
mod policy;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use circuit::{CircuitBreaker, CircuitPermit, CircuitState};
pub use policy::{apply_jitter, RetryPolicy};

use crate::error::{error_category_label, GenerationError};

/// Retry and circuit breaker settings, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, including the first.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Consecutive failures that open the breaker.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }

    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.circuit_breaker_threshold,
            Duration::from_millis(self.circuit_breaker_cooldown_ms),
        )
    }
}

/// Counters over every call made through an executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    pub attempts: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    attempts: AtomicU64,
    retries: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// Executes fallible backend attempts under a fixed [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    counters: RetryCounters,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            policy,
            breaker,
            counters: RetryCounters::default(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.policy(), config.breaker())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent. The closure receives the 1-based attempt number.
    ///
    /// The wait between attempts is the policy backoff, raised to the
    /// backend's retry-after hint when one is given.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, GenerationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let max_attempts = self.policy.attempts();
        let mut attempt = 1;
        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(err) => {
                    self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, "circuit open, not contacting backend");
                    return Err(err);
                }
            };

            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            let err = match operation(attempt).await {
                Ok(value) => {
                    permit.success();
                    return Ok(value);
                }
                Err(err) => {
                    permit.failure();
                    err
                }
            };

            if !err.is_retryable() {
                debug!(
                    attempt,
                    category = error_category_label(&err.classify()),
                    error = %err,
                    "non-retryable failure"
                );
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let mut delay = self.policy.delay_for(attempt);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                category = error_category_label(&err.classify()),
                error = %err,
                "retrying after transient failure"
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PermanentReason;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn executor(max_retries: u32, threshold: u32) -> RetryExecutor {
        let policy = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            exponential_base: 2.0,
            jitter: false,
        };
        RetryExecutor::new(policy, CircuitBreaker::new(threshold, Duration::from_secs(30)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = executor(4, 10);
        let calls = AtomicU32::new(0);

        let start = Instant::now();
        let result = executor
            .execute_with_retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(GenerationError::upstream(503, "unavailable"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms then 200ms of backoff.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
        assert_eq!(executor.breaker().consecutive_failures(), 0);
        assert_eq!(executor.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let executor = executor(5, 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GenerationError::permanent(PermanentReason::Unauthorized, "bad key")) }
            })
            .await;

        assert!(matches!(result, Err(GenerationError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let executor = executor(3, 10);

        let result: Result<(), _> = executor
            .execute_with_retry(|attempt| async move {
                Err(GenerationError::upstream(500 + attempt as u16, "boom"))
            })
            .await;

        assert_eq!(result, Err(GenerationError::upstream(503, "boom")));
        assert_eq!(executor.stats().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_wait() {
        let executor = executor(2, 10);

        let start = Instant::now();
        let result = executor
            .execute_with_retry(|attempt| async move {
                if attempt == 1 {
                    Err(GenerationError::RateLimited {
                        retry_after: Some(Duration::from_secs(5)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_backend() {
        let executor = executor(1, 3);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result: Result<(), _> = executor
                .execute_with_retry(|_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(GenerationError::upstream(502, "bad gateway")) }
                })
                .await;
            assert!(matches!(result, Err(GenerationError::Upstream { .. })));
        }
        assert_eq!(executor.circuit_state(), CircuitState::Open);

        let result: Result<(), _> = executor
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(GenerationError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.stats().circuit_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_recovers_after_cooldown() {
        let executor = executor(1, 1);
        let _: Result<(), _> = executor
            .execute_with_retry(|_| async { Err(GenerationError::upstream(500, "down")) })
            .await;
        assert_eq!(executor.circuit_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let result = executor.execute_with_retry(|_| async { Ok(7) }).await;

        assert_eq!(result, Ok(7));
        assert_eq!(executor.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_when_circuit_opens_mid_call() {
        let executor = executor(5, 2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GenerationError::Timeout {
                        elapsed: Duration::from_secs(1),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(GenerationError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_config_builds_policy() {
        let config = RetryConfig {
            max_retries: 4,
            base_delay_ms: 250,
            ..RetryConfig::default()
        };
        let policy = config.policy();
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(config.breaker().threshold(), 5);
    }
}
