//! What happens to work the budget gate turned down.

use serde::{Deserialize, Serialize};

use crate::backend::GenerationOperation;

/// Handling of an operation whose overrun was not approved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStrategy {
    /// Record the rejection and move on.
    #[default]
    Skip,
    /// Retry with progressively cheaper complexity tiers before skipping.
    Degrade,
}

impl RejectionStrategy {
    /// Cheaper substitutes to try, cheapest last. Empty for `Skip`.
    pub fn substitutes(&self, operation: &GenerationOperation) -> Vec<GenerationOperation> {
        match self {
            RejectionStrategy::Skip => Vec::new(),
            RejectionStrategy::Degrade => {
                let mut out = Vec::new();
                let mut current = operation.degraded();
                while let Some(op) = current {
                    current = op.degraded();
                    out.push(op);
                }
                out
            }
        }
    }
}
