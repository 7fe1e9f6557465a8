//! Classification of generation errors into handling categories.

use serde::{Deserialize, Serialize};

use super::GenerationError;

/// How a failure should be handled by the layers above the backend.
///
/// The payload names the concrete cause so that metrics and checkpoints can
/// aggregate without holding on to the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Worth retrying after a backoff.
    Transient(TransientKind),
    /// Budget or quota refusal; resolved by approval, not by retrying.
    UsageLimit(UsageLimitKind),
    /// Never retried.
    Fatal(FatalKind),
    /// Attempt exceeded its deadline; retried like a transient failure.
    Timeout(TimeoutKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransientKind {
    RateLimited,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageLimitKind {
    Budget,
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FatalKind {
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    Request,
}

impl GenerationError {
    /// Map this error onto its handling category.
    pub fn classify(&self) -> ErrorCategory {
        match self {
            GenerationError::RateLimited { .. } => {
                ErrorCategory::Transient(TransientKind::RateLimited)
            }
            GenerationError::Upstream { .. } => ErrorCategory::Transient(TransientKind::Upstream),
            GenerationError::Timeout { .. } => ErrorCategory::Timeout(TimeoutKind::Request),
            GenerationError::Permanent { .. } => ErrorCategory::Fatal(FatalKind::Permanent),
            GenerationError::BudgetExceeded { .. } => {
                ErrorCategory::UsageLimit(UsageLimitKind::Budget)
            }
            GenerationError::CircuitOpen { .. } => {
                ErrorCategory::UsageLimit(UsageLimitKind::CircuitOpen)
            }
        }
    }
}

/// Convert an error category into a stable label for metrics and checkpoints.
pub fn error_category_label(category: &ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Transient(TransientKind::RateLimited) => "rate_limited",
        ErrorCategory::Transient(TransientKind::Upstream) => "transient",
        ErrorCategory::UsageLimit(UsageLimitKind::Budget) => "budget_exceeded",
        ErrorCategory::UsageLimit(UsageLimitKind::CircuitOpen) => "circuit_open",
        ErrorCategory::Fatal(_) => "fatal",
        ErrorCategory::Timeout(_) => "timeout",
    }
}
