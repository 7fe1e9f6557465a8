//! Session-scoped request governance.
//!
//! A [`SessionContext`] owns everything one generation session shares: the
//! rate limiter, the retry executor and its circuit breaker, the cost guard
//! and ledger, the character store and the backend. Nothing is global, so
//! two sessions in one process never see each other's budget.
//!
//! [`SessionContext::generate`] is the only way a request reaches the
//! backend. The budget is checked (and the estimate reserved) once per
//! request; each attempt made by the retry executor then takes its own
//! rate limiter permit and runs under the per-request timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{GenerationBackend, GenerationRequest, MediaResult};
use crate::budget::{ApprovalPrompt, BudgetDecision, CostGuard};
use crate::characters::SharedCharacterStore;
use crate::config::SessionConfig;
use crate::error::GenerationError;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryExecutor;
use crate::timeout::{with_request_timeout, TimeoutConfig};

/// How one request ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Succeeded { result: MediaResult },
    Failed { error: String, category: String },
    /// Never sent: the budget gate turned it down.
    Skipped { reason: String },
}

impl RequestOutcome {
    pub fn result(&self) -> Option<&MediaResult> {
        match self {
            RequestOutcome::Succeeded { result } => Some(result),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Succeeded { .. })
    }
}

/// Everything known about one request once it has finished.
#[derive(Debug, Clone)]
pub struct RequestReport {
    pub request_id: String,
    pub outcome: RequestOutcome,
    /// The classified error for failed requests.
    pub error: Option<GenerationError>,
    pub attempts: u32,
    pub estimate: f64,
    /// Spend recorded in the ledger for this request.
    pub cost: f64,
    /// Sent at a lower complexity tier than planned.
    pub degraded: bool,
    pub duration: Duration,
}

/// The session-scoped object every request goes through.
pub struct SessionContext {
    session_id: String,
    backend: Arc<dyn GenerationBackend>,
    limiter: RateLimiter,
    executor: RetryExecutor,
    cost_guard: CostGuard,
    characters: SharedCharacterStore,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("backend", &self.backend.name())
            .field("limiter", &self.limiter)
            .field("executor", &self.executor)
            .field("cost_guard", &self.cost_guard)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        config: &SessionConfig,
        backend: Arc<dyn GenerationBackend>,
        approval: Arc<dyn ApprovalPrompt>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            backend,
            limiter: RateLimiter::new(&config.rate_limit),
            executor: RetryExecutor::from_config(&config.retry),
            cost_guard: CostGuard::new(config.budget.clone(), approval),
            characters: SharedCharacterStore::default(),
            timeouts: config.timeout.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn backend(&self) -> &dyn GenerationBackend {
        self.backend.as_ref()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub fn cost_guard(&self) -> &CostGuard {
        &self.cost_guard
    }

    pub fn characters(&self) -> &SharedCharacterStore {
        &self.characters
    }

    /// Requests that may be in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.limiter.stats().max_concurrent
    }

    /// Send one request through budget, retry, rate limit and timeout.
    ///
    /// `preapproved` skips the limit check for requests whose overrun was
    /// already approved as part of their stage. Never returns an error: the
    /// outcome says what happened.
    pub async fn generate(&self, request: &GenerationRequest, preapproved: bool) -> RequestReport {
        let started = Instant::now();
        let planned = self.cost_guard.estimate(&request.operation);

        let decision = if preapproved {
            self.cost_guard.reserve_approved(&request.operation)
        } else {
            self.cost_guard.check_and_reserve(&request.operation).await
        };

        let (reservation, request, degraded) = match decision {
            BudgetDecision::Allowed { reservation, .. } | BudgetDecision::Approved { reservation } => {
                (reservation, request.clone(), false)
            }
            BudgetDecision::Rejected { reason, .. } => match self.degrade(request) {
                Some((reservation, degraded)) => (reservation, degraded, true),
                None => {
                    warn!(request = %request.id, reason = %reason, "request skipped by budget gate");
                    return RequestReport {
                        request_id: request.id.clone(),
                        outcome: RequestOutcome::Skipped { reason },
                        error: None,
                        attempts: 0,
                        estimate: planned,
                        cost: 0.0,
                        degraded: false,
                        duration: started.elapsed(),
                    };
                }
            },
        };
        let estimate = reservation.amount();

        let limiter = &self.limiter;
        let backend = self.backend.as_ref();
        let limit = self.timeouts.request_timeout();
        let outgoing = &request;
        let mut attempts = 0;
        let result = self
            .executor
            .execute_with_retry(|attempt| {
                attempts = attempt;
                async move {
                    let _permit = limiter.acquire().await;
                    with_request_timeout(limit, backend.generate(outgoing)).await
                }
            })
            .await;

        match result {
            Ok(result) => {
                let cost = result.cost.unwrap_or(estimate);
                self.cost_guard.commit(reservation, cost, result.tokens_used);
                debug!(request = %request.id, attempts, cost, "request succeeded");
                RequestReport {
                    request_id: request.id.clone(),
                    outcome: RequestOutcome::Succeeded { result },
                    error: None,
                    attempts,
                    estimate,
                    cost,
                    degraded,
                    duration: started.elapsed(),
                }
            }
            Err(err) => {
                self.cost_guard.release(reservation);
                warn!(request = %request.id, attempts, error = %err, "request failed");
                RequestReport {
                    request_id: request.id.clone(),
                    outcome: RequestOutcome::Failed {
                        error: err.to_string(),
                        category: crate::error::error_category_label(&err.classify()).to_string(),
                    },
                    error: Some(err),
                    attempts,
                    estimate,
                    cost: 0.0,
                    degraded,
                    duration: started.elapsed(),
                }
            }
        }
    }

    /// Try cheaper tiers of a rejected request under the session's
    /// rejection strategy, without prompting again.
    fn degrade(&self, request: &GenerationRequest) -> Option<(crate::budget::Reservation, GenerationRequest)> {
        let strategy = self.cost_guard.policy().on_rejection;
        strategy.substitutes(&request.operation).into_iter().find_map(|operation| {
            let reservation = self.cost_guard.try_reserve(&operation)?;
            warn!(
                request = %request.id,
                complexity = ?operation.complexity,
                "request degraded to fit budget"
            );
            let mut degraded = request.clone();
            degraded.operation = operation;
            Some((reservation, degraded))
        })
    }
}
