//! Token bucket admission.

use std::time::Duration;

use tokio::time::Instant;

/// Continuously refilled token bucket.
///
/// Tokens are fractional so that slow refill rates (one request every few
/// seconds) still accumulate smoothly between observations.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// `refill_rate` is in tokens per second. Non-positive capacities are
    /// raised to one token so that a bucket can always eventually admit.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        let max_tokens = max_tokens.max(1.0);
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: refill_rate.max(0.0),
            last_refill: Instant::now(),
        }
    }

    /// Bucket sized from a per-minute request ceiling.
    pub fn per_minute(max_requests_per_minute: u32, burst: u32) -> Self {
        Self::new(burst as f64, max_requests_per_minute as f64 / 60.0)
    }

    /// Add tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.time_until_token())
        }
    }

    /// Wait until the next whole token.
    pub fn time_until_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        let missing = 1.0 - self.tokens;
        // Round up to the next millisecond so the recheck never lands early.
        let millis = (missing / self.refill_rate * 1000.0).ceil();
        Duration::from_millis(millis.max(1.0) as u64)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}
