//! Circuit breaker shared by every call made through one executor.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::GenerationError;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// `Closed --failures>=T--> Open --cooldown--> HalfOpen --success--> Closed`,
/// `HalfOpen --failure--> Open`.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// A threshold of zero is treated as one.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move `Open` to `HalfOpen` once the cooldown has fully elapsed.
    fn advance(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(self.cooldown);
        if elapsed >= self.cooldown {
            info!("circuit breaker half-open, admitting one trial call");
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    /// Current state, after applying any due cooldown transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Ask to contact the backend. Fails fast with
    /// [`GenerationError::CircuitOpen`] while the breaker is open or while a
    /// half-open trial is already running.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, GenerationError> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.advance(&mut inner, now);
        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(CircuitPermit::new(self, true))
            }
            CircuitState::HalfOpen => Err(GenerationError::CircuitOpen {
                retry_in: self.cooldown,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                Err(GenerationError::CircuitOpen {
                    retry_in: self.cooldown.saturating_sub(elapsed),
                })
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            info!("circuit breaker closed after successful call");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let reopen = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.threshold,
            CircuitState::Open => false,
        };
        if reopen {
            warn!(
                failures = inner.consecutive_failures,
                threshold = self.threshold,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        inner.trial_in_flight = false;
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }
}

/// Admission through the breaker for one attempt.
///
/// Report the outcome with [`CircuitPermit::success`] or
/// [`CircuitPermit::failure`]. A permit dropped without an outcome (the
/// attempt was cancelled) frees the half-open trial slot without counting.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandoned(self.trial);
        }
    }
}
