//! Error types for generation requests.
//!
//! Every failure a backend call can produce is folded into the closed
//! [`GenerationError`] set. Callers never compare strings: the variant
//! itself says whether the failure is worth retrying, and carries the
//! structured detail (retry-after hint, upstream status, cause).

pub mod classification;

use std::time::Duration;

use thiserror::Error;

pub use classification::{error_category_label, ErrorCategory};

/// Failure of a single generation request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// The backend throttled the request.
    #[error("rate limited by backend{}", format_retry_after(.retry_after))]
    RateLimited {
        /// Backend-suggested wait before the next attempt.
        retry_after: Option<Duration>,
    },

    /// The request did not complete in time.
    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Transient upstream failure (5xx-equivalent, connection reset).
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Failure that will not go away on retry: bad credentials, malformed
    /// request, unsupported model.
    #[error("permanent failure ({reason}): {message}")]
    Permanent {
        reason: PermanentReason,
        message: String,
    },

    /// The operation would exceed the session budget and was not approved.
    #[error("budget exceeded: estimate {estimate:.4} with spend {spent:.4} against limit {limit:.4}")]
    BudgetExceeded {
        estimate: f64,
        spent: f64,
        limit: f64,
    },

    /// The circuit breaker is open; the backend was not contacted.
    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
}

/// Why a failure is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentReason {
    Unauthorized,
    MalformedRequest,
    UnsupportedModel,
    ContentRejected,
}

impl std::fmt::Display for PermanentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PermanentReason::Unauthorized => "unauthorized",
            PermanentReason::MalformedRequest => "malformed_request",
            PermanentReason::UnsupportedModel => "unsupported_model",
            PermanentReason::ContentRejected => "content_rejected",
        };
        f.write_str(label)
    }
}

impl GenerationError {
    /// Convenience constructor for permanent failures.
    pub fn permanent(reason: PermanentReason, message: impl Into<String>) -> Self {
        Self::Permanent {
            reason,
            message: message.into(),
        }
    }

    /// Convenience constructor for transient upstream failures.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorCategory::Transient(_) | ErrorCategory::Timeout(_))
    }

    /// Backend-suggested delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::RateLimited { retry_after } => *retry_after,
            GenerationError::CircuitOpen { retry_in } => Some(*retry_in),
            _ => None,
        }
    }
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {:?}", d),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(GenerationError::RateLimited { retry_after: None }.is_retryable());
        assert!(GenerationError::Timeout {
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(GenerationError::upstream(503, "unavailable").is_retryable());
    }

    #[test]
    fn test_non_retryable_variants() {
        assert!(!GenerationError::permanent(PermanentReason::Unauthorized, "bad key").is_retryable());
        assert!(!GenerationError::BudgetExceeded {
            estimate: 60.0,
            spent: 0.0,
            limit: 50.0
        }
        .is_retryable());
        assert!(!GenerationError::CircuitOpen {
            retry_in: Duration::from_secs(5)
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = GenerationError::RateLimited {
            retry_after: Some(Duration::from_millis(250)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert!(err.to_string().contains("retry after"));

        let err = GenerationError::upstream(500, "boom");
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_permanent_display() {
        let err = GenerationError::permanent(PermanentReason::UnsupportedModel, "veo-9");
        assert_eq!(
            err.to_string(),
            "permanent failure (unsupported_model): veo-9"
        );
    }
}
