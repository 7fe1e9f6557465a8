//! Approval collaborator consulted when an operation would cross the limit.

use async_trait::async_trait;

/// Decides whether a budget overrun may proceed.
///
/// Implementations may wait on a human; the wait is cancellable by dropping
/// the future.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn request_approval(&self, estimated_cost: f64, current_spend: f64, limit: f64) -> bool;
}

/// Approves every overrun.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalPrompt for AutoApprove {
    async fn request_approval(&self, _estimated_cost: f64, _current_spend: f64, _limit: f64) -> bool {
        true
    }
}

/// Denies every overrun; the limit is a hard stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

#[async_trait]
impl ApprovalPrompt for AutoDeny {
    async fn request_approval(&self, _estimated_cost: f64, _current_spend: f64, _limit: f64) -> bool {
        false
    }
}

/// Approves overruns as long as projected spend stays under a second,
/// higher ceiling.
#[derive(Debug, Clone, Copy)]
pub struct CeilingApproval {
    ceiling: f64,
}

impl CeilingApproval {
    pub fn new(ceiling: f64) -> Self {
        Self { ceiling }
    }
}

#[async_trait]
impl ApprovalPrompt for CeilingApproval {
    async fn request_approval(&self, estimated_cost: f64, current_spend: f64, _limit: f64) -> bool {
        current_spend + estimated_cost <= self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_answers() {
        assert!(AutoApprove.request_approval(60.0, 0.0, 50.0).await);
        assert!(!AutoDeny.request_approval(60.0, 0.0, 50.0).await);
    }

    #[tokio::test]
    async fn test_ceiling() {
        let approval = CeilingApproval::new(75.0);
        assert!(approval.request_approval(60.0, 10.0, 50.0).await);
        assert!(!approval.request_approval(60.0, 20.0, 50.0).await);
    }
}
