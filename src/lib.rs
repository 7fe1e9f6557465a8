//! Request governance and stage orchestration for generative media
//! pipelines.
//!
//! Every backend call made by a pipeline goes through one
//! [`SessionContext`]: the cost guard checks and reserves the estimate, the
//! retry executor (with its circuit breaker) drives the attempts, and each
//! attempt takes a rate limiter permit and runs under the request timeout.
//! The [`PipelineOrchestrator`] runs stages in order on top of that, with a
//! checkpoint after every stage so a paused or failed run can resume.

pub mod backend;
pub mod budget;
pub mod characters;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod session;
pub mod timeout;

pub use backend::{
    Complexity, DryRunBackend, GenerationBackend, GenerationOperation, GenerationRequest, MediaKind, MediaResult,
};
pub use budget::{ApprovalPrompt, BudgetPolicy, BudgetStatus, CostGuard, UsageLedger};
pub use characters::{CharacterConsistencyStore, CharacterRecord, SharedCharacterStore};
pub use crate::config::{ConfigError, SessionConfig};
pub use error::GenerationError;
pub use pipeline::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PipelineConfig, PipelineError, PipelineHandle,
    PipelineOrchestrator, PipelineOutcome, PipelineState, RunStatus,
};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{RetryConfig, RetryExecutor};
pub use session::SessionContext;
