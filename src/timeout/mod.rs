//! Timeout configuration for backend attempts.
//!
//! Each backend attempt is bounded by [`TimeoutConfig::request_timeout`].
//! An attempt that runs past it is dropped and reported as
//! [`GenerationError::Timeout`], which the retry executor treats as
//! transient.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Configuration for timeout behavior of backend calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum time allowed for a single backend attempt.
    /// Default: 120 seconds
    pub request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 120_000,
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Run one backend attempt under `limit`.
pub async fn with_request_timeout<T, F>(limit: Duration, attempt: F) -> Result<T, GenerationError>
where
    F: Future<Output = Result<T, GenerationError>>,
{
    match tokio::time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::Timeout { elapsed: limit }),
    }
}
