//! Usage ledger and the budget gate in front of every billable request.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::approval::ApprovalPrompt;
use super::config::BudgetPolicy;
use super::estimator::CostEstimator;
use crate::backend::GenerationOperation;

/// Slack for float comparisons against the limit.
const EPSILON: f64 = 1e-9;

/// Budget status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    /// Under warning threshold, all good
    Ok,
    /// Approaching budget limit (over warning threshold)
    Warning,
    /// Near budget limit (over critical threshold)
    Critical,
    /// Budget exceeded
    Exceeded,
}

impl BudgetStatus {
    /// Check if status allows continuing without approval.
    pub fn should_continue(&self) -> bool {
        !matches!(self, BudgetStatus::Exceeded)
    }

    /// Check if status should trigger a warning.
    pub fn should_warn(&self) -> bool {
        !matches!(self, BudgetStatus::Ok)
    }
}

/// Running totals for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    pub total_cost: f64,
    pub request_count: u64,
    pub tokens_consumed: u64,
    /// Requests left under the provider quota; `None` when unbounded.
    pub quota_remaining: Option<u64>,
}

/// Outcome of comparing a prospective charge with the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    WithinBudget,
    /// Proceeds, but crosses the warning threshold.
    Warning,
    /// Would exceed the limit; needs the approval collaborator.
    NeedsApproval,
}

/// Result of [`CostGuard::check_and_reserve`].
#[derive(Debug)]
pub enum BudgetDecision {
    Allowed { reservation: Reservation, warning: bool },
    /// Over the limit, but the approval collaborator said yes.
    Approved { reservation: Reservation },
    Rejected { estimate: f64, reason: String },
}

impl BudgetDecision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, BudgetDecision::Rejected { .. })
    }

    pub fn into_reservation(self) -> Option<Reservation> {
        match self {
            BudgetDecision::Allowed { reservation, .. } | BudgetDecision::Approved { reservation } => {
                Some(reservation)
            }
            BudgetDecision::Rejected { .. } => None,
        }
    }
}

#[derive(Debug)]
struct GuardState {
    ledger: UsageLedger,
    reserved_cost: f64,
    reserved_requests: u64,
}

impl GuardState {
    fn quota_exhausted(&self) -> bool {
        self.ledger
            .quota_remaining
            .map(|left| left <= self.reserved_requests)
            .unwrap_or(false)
    }

    fn committed_and_reserved(&self) -> f64 {
        self.ledger.total_cost + self.reserved_cost
    }
}

struct GuardInner {
    policy: BudgetPolicy,
    estimator: CostEstimator,
    approval: Arc<dyn ApprovalPrompt>,
    state: Mutex<GuardState>,
    /// One approval conversation at a time.
    approvals: tokio::sync::Mutex<()>,
}

impl GuardInner {
    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status_of(&self, spend: f64) -> BudgetStatus {
        if self.policy.limit <= 0.0 {
            return if spend > 0.0 {
                BudgetStatus::Exceeded
            } else {
                BudgetStatus::Ok
            };
        }
        let usage = spend / self.policy.limit;
        if usage >= 1.0 {
            BudgetStatus::Exceeded
        } else if usage >= self.policy.critical_threshold {
            BudgetStatus::Critical
        } else if usage >= self.policy.warning_threshold {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    fn check(&self, state: &GuardState, amount: f64) -> BudgetCheck {
        let projected = state.committed_and_reserved() + amount;
        if projected > self.policy.limit + EPSILON {
            BudgetCheck::NeedsApproval
        } else if projected + EPSILON >= self.policy.warning_amount() {
            BudgetCheck::Warning
        } else {
            BudgetCheck::WithinBudget
        }
    }

    fn release(&self, amount: f64) {
        let mut state = self.state();
        state.reserved_cost = (state.reserved_cost - amount).max(0.0);
        state.reserved_requests = state.reserved_requests.saturating_sub(1);
    }
}

/// Estimates, reserves and records spend for one session.
///
/// Every ledger mutation goes through this type and happens under a single
/// lock, so concurrent requests observe a consistent ledger and commits land
/// in completion order. Estimates are held as reservations while a request
/// is in flight, which keeps concurrent requests from jointly overshooting
/// the limit.
#[derive(Clone)]
pub struct CostGuard {
    inner: Arc<GuardInner>,
}

impl fmt::Debug for CostGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostGuard")
            .field("policy", &self.inner.policy)
            .field("ledger", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl CostGuard {
    pub fn new(policy: BudgetPolicy, approval: Arc<dyn ApprovalPrompt>) -> Self {
        let estimator = CostEstimator::new(policy.costs.clone());
        let ledger = UsageLedger {
            quota_remaining: policy.request_quota,
            ..UsageLedger::default()
        };
        Self {
            inner: Arc::new(GuardInner {
                policy,
                estimator,
                approval,
                state: Mutex::new(GuardState {
                    ledger,
                    reserved_cost: 0.0,
                    reserved_requests: 0,
                }),
                approvals: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.inner.policy
    }

    pub fn estimate(&self, operation: &GenerationOperation) -> f64 {
        self.inner.estimator.estimate(operation)
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.inner.estimator
    }

    /// Compare `amount` on top of committed and reserved spend with the limit.
    pub fn evaluate(&self, amount: f64) -> BudgetCheck {
        let state = self.inner.state();
        self.inner.check(&state, amount)
    }

    /// Estimate `operation` and hold the estimate if the budget allows it,
    /// consulting the approval collaborator when it would cross the limit.
    pub async fn check_and_reserve(&self, operation: &GenerationOperation) -> BudgetDecision {
        let estimate = self.estimate(operation);
        {
            let mut state = self.inner.state();
            if state.quota_exhausted() {
                return quota_rejection(estimate);
            }
            match self.inner.check(&state, estimate) {
                BudgetCheck::WithinBudget => {
                    return BudgetDecision::Allowed {
                        reservation: self.reserve_locked(&mut state, estimate),
                        warning: false,
                    };
                }
                BudgetCheck::Warning => {
                    warn!(
                        estimate,
                        spent = state.committed_and_reserved(),
                        limit = self.inner.policy.limit,
                        model = %operation.model,
                        "operation crosses budget warning threshold"
                    );
                    return BudgetDecision::Allowed {
                        reservation: self.reserve_locked(&mut state, estimate),
                        warning: true,
                    };
                }
                BudgetCheck::NeedsApproval => {}
            }
        }

        if !self.request_approval(estimate).await {
            return BudgetDecision::Rejected {
                estimate,
                reason: format!(
                    "estimated cost {:.4} would exceed budget limit {:.4} and was not approved",
                    estimate, self.inner.policy.limit
                ),
            };
        }
        self.reserve_approved_amount(estimate)
    }

    /// Reserve without prompting. Returns `None` if the operation would need
    /// approval or the quota is used up.
    pub fn try_reserve(&self, operation: &GenerationOperation) -> Option<Reservation> {
        let estimate = self.estimate(operation);
        let mut state = self.inner.state();
        if state.quota_exhausted() || self.inner.check(&state, estimate) == BudgetCheck::NeedsApproval {
            return None;
        }
        Some(self.reserve_locked(&mut state, estimate))
    }

    /// Reserve an operation whose overrun was already approved (for example
    /// by a stage-level approval). The request quota still applies.
    pub fn reserve_approved(&self, operation: &GenerationOperation) -> BudgetDecision {
        self.reserve_approved_amount(self.estimate(operation))
    }

    fn reserve_approved_amount(&self, estimate: f64) -> BudgetDecision {
        let mut state = self.inner.state();
        if state.quota_exhausted() {
            return quota_rejection(estimate);
        }
        BudgetDecision::Approved {
            reservation: self.reserve_locked(&mut state, estimate),
        }
    }

    /// Ask the approval collaborator about an overrun of `amount`.
    pub async fn request_approval(&self, amount: f64) -> bool {
        let _turn = self.inner.approvals.lock().await;
        let spent = self.inner.state().committed_and_reserved();
        let limit = self.inner.policy.limit;
        let approved = self.inner.approval.request_approval(amount, spent, limit).await;
        if approved {
            info!(estimate = amount, spent, limit, "budget overrun approved");
        } else {
            warn!(estimate = amount, spent, limit, "budget overrun denied");
        }
        approved
    }

    fn reserve_locked(&self, state: &mut GuardState, amount: f64) -> Reservation {
        state.reserved_cost += amount;
        state.reserved_requests += 1;
        Reservation {
            inner: Some(Arc::clone(&self.inner)),
            amount,
        }
    }

    /// Turn a reservation into recorded spend. All ledger fields move
    /// together.
    pub fn commit(&self, mut reservation: Reservation, cost: f64, tokens_used: u64) -> BudgetStatus {
        reservation.inner.take();
        let mut state = self.inner.state();
        let before = self.inner.status_of(state.ledger.total_cost);

        state.reserved_cost = (state.reserved_cost - reservation.amount).max(0.0);
        state.reserved_requests = state.reserved_requests.saturating_sub(1);
        state.ledger.total_cost += cost.max(0.0);
        state.ledger.request_count += 1;
        state.ledger.tokens_consumed += tokens_used;
        if let Some(left) = state.ledger.quota_remaining.as_mut() {
            *left = left.saturating_sub(1);
        }

        let after = self.inner.status_of(state.ledger.total_cost);
        if after > before {
            warn!(
                status = ?after,
                total_cost = state.ledger.total_cost,
                limit = self.inner.policy.limit,
                "budget status changed"
            );
        }
        after
    }

    /// Give a reservation back without charging anything.
    pub fn release(&self, reservation: Reservation) {
        drop(reservation);
    }

    pub fn snapshot(&self) -> UsageLedger {
        self.inner.state().ledger.clone()
    }

    /// Replace the ledger, e.g. from a checkpoint. Outstanding reservations
    /// are unaffected.
    pub fn restore(&self, ledger: UsageLedger) {
        self.inner.state().ledger = ledger;
    }

    pub fn status(&self) -> BudgetStatus {
        let total = self.inner.state().ledger.total_cost;
        self.inner.status_of(total)
    }

    pub fn reserved(&self) -> f64 {
        self.inner.state().reserved_cost
    }

    /// Budget left after committed spend.
    pub fn remaining(&self) -> f64 {
        self.inner.policy.limit - self.inner.state().ledger.total_cost
    }
}

fn quota_rejection(estimate: f64) -> BudgetDecision {
    BudgetDecision::Rejected {
        estimate,
        reason: "backend request quota exhausted".to_string(),
    }
}

/// Estimate held against the budget while a request is in flight.
///
/// Dropping an unsettled reservation releases it.
pub struct Reservation {
    inner: Option<Arc<GuardInner>>,
    amount: f64,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("amount", &self.amount)
            .field("settled", &self.inner.is_none())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release(self.amount);
        }
    }
}
