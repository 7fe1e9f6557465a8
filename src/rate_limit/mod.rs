//! Admission control for outbound generation requests.
//!
//! Every backend attempt must hold a [`RateLimitPermit`]. A permit is granted
//! only when the token bucket has a whole token *and* the concurrency gate
//! has a free slot; both checks and both updates happen under one lock so
//! no observer ever sees a negative bucket or an over-full gate.
//!
//! Waiting never spins: a caller blocked on tokens sleeps until the next
//! token is due, a caller blocked on concurrency parks until a permit is
//! dropped.

mod bucket;
mod gate;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

pub use bucket::TokenBucket;
pub use gate::ConcurrencyGate;

/// Rate limit settings for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained request ceiling.
    pub max_requests_per_minute: u32,
    /// Maximum requests in flight at once.
    pub max_concurrent_requests: u32,
    /// Bucket capacity. Defaults to one minute's worth of requests.
    pub burst: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            max_concurrent_requests: 3,
            burst: None,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests_per_minute: u32, max_concurrent_requests: u32) -> Self {
        Self {
            max_requests_per_minute,
            max_concurrent_requests,
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn effective_burst(&self) -> u32 {
        self.burst.unwrap_or(self.max_requests_per_minute).max(1)
    }
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub tokens: f64,
    pub max_tokens: f64,
    pub active: usize,
    pub max_concurrent: usize,
    pub peak_active: usize,
    pub granted: u64,
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    gate: ConcurrencyGate,
    granted: u64,
}

#[derive(Debug)]
struct LimiterInner {
    state: Mutex<LimiterState>,
    released: Notify,
}

impl LimiterInner {
    fn state(&self) -> MutexGuard<'_, LimiterState> {
        // No invariant can be half-updated under this lock, so a poisoned
        // guard is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Token bucket plus concurrency gate, shared by all requests of a session.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

/// Why an acquire attempt could not be granted right now.
enum Blocked {
    Concurrency,
    Tokens(Duration),
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let bucket =
            TokenBucket::per_minute(config.max_requests_per_minute, config.effective_burst());
        Self::from_parts(bucket, config.max_concurrent_requests as usize)
    }

    pub fn from_parts(bucket: TokenBucket, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimiterState {
                    bucket,
                    gate: ConcurrencyGate::new(max_concurrent),
                    granted: 0,
                }),
                released: Notify::new(),
            }),
        }
    }

    /// Wait for a permit. Never fails, only delays.
    pub async fn acquire(&self) -> RateLimitPermit {
        loop {
            // Register interest before checking so a release between the
            // check and the await is not lost.
            let released = self.inner.released.notified();

            match self.try_grant() {
                Ok(permit) => return permit,
                Err(Blocked::Concurrency) => {
                    trace!("rate limiter waiting for a concurrency slot");
                    released.await;
                }
                Err(Blocked::Tokens(wait)) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting for tokens");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Grant a permit only if one is available immediately.
    pub fn try_acquire(&self) -> Option<RateLimitPermit> {
        self.try_grant().ok()
    }

    fn try_grant(&self) -> Result<RateLimitPermit, Blocked> {
        let mut state = self.inner.state();
        if !state.gate.has_capacity() {
            return Err(Blocked::Concurrency);
        }
        state
            .bucket
            .try_take(Instant::now())
            .map_err(Blocked::Tokens)?;
        state.gate.try_enter();
        state.granted += 1;
        Ok(RateLimitPermit {
            inner: Some(Arc::clone(&self.inner)),
        })
    }

    /// Return a permit explicitly. Dropping it has the same effect.
    pub fn release(&self, permit: RateLimitPermit) {
        drop(permit);
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.inner.state();
        state.bucket.refill(Instant::now());
        RateLimiterStats {
            tokens: state.bucket.tokens(),
            max_tokens: state.bucket.max_tokens(),
            active: state.gate.active(),
            max_concurrent: state.gate.max_concurrent(),
            peak_active: state.gate.peak(),
            granted: state.granted,
        }
    }
}

/// Proof of admission. Releases its concurrency slot when dropped, so every
/// exit path (success, error, cancellation, panic) gives the slot back.
#[derive(Debug)]
pub struct RateLimitPermit {
    inner: Option<Arc<LimiterInner>>,
}

impl Drop for RateLimitPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.state().gate.leave();
            inner.released.notify_waiters();
        }
    }
}
