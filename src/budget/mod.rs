//! Cost budget management for generation sessions.
//!
//! This module keeps generation spend inside a caller-defined limit. Nothing
//! crosses the limit silently: an operation that would exceed it is put to
//! an [`ApprovalPrompt`] first, and a denied operation never touches the
//! ledger.
//!
//! # Overview
//!
//! - **BudgetPolicy**: limit, warning/critical thresholds, quota, cost table
//! - **CostEstimator**: pre-execution estimate from kind, complexity and size
//! - **CostGuard**: the single entry point that reserves, commits and
//!   releases spend against the [`UsageLedger`]
//! - **RejectionStrategy**: skip, or degrade to a cheaper complexity tier
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use reelforge::budget::{AutoDeny, BudgetPolicy, CostGuard};
//!
//! let guard = CostGuard::new(BudgetPolicy::new(50.0), Arc::new(AutoDeny));
//!
//! if let Some(reservation) = guard.check_and_reserve(&operation).await.into_reservation() {
//!     // send the request, then
//!     guard.commit(reservation, actual_cost, tokens_used);
//! }
//! ```

mod approval;
mod config;
mod estimator;
mod strategy;
mod tracker;

pub use approval::{ApprovalPrompt, AutoApprove, AutoDeny, CeilingApproval};
pub use config::{complexity_multiplier, BudgetPolicy, CostTable};
pub use estimator::CostEstimator;
pub use strategy::RejectionStrategy;
pub use tracker::{BudgetCheck, BudgetDecision, BudgetStatus, CostGuard, Reservation, UsageLedger};
