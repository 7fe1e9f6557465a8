//! Budget enforcement at request and stage level.

use std::sync::Arc;
use std::time::Duration;

use reelforge::backend::{Complexity, GenerationOperation, GenerationRequest, MediaKind, MediaResult};
use reelforge::budget::{AutoDeny, BudgetPolicy, CeilingApproval, RejectionStrategy};
use reelforge::pipeline::{
    MemoryCheckpointStore, PipelineError, PipelineOrchestrator, RunStatus, Stage, StageContext, StageOutput,
    StageStatus,
};
use reelforge::session::RequestOutcome;
use reelforge::{SessionConfig, SessionContext};
use serde_json::json;

use crate::common::CountingBackend;

/// Estimates to 0.50 * 2.0 * 60 = 60.
fn long_video(id: &str) -> GenerationRequest {
    let op = GenerationOperation::new(MediaKind::Video, "clip")
        .with_complexity(Complexity::High)
        .with_input_size(60_000);
    GenerationRequest::new(id, op, "a minute of storm footage")
}

fn session(limit: f64, backend: Arc<CountingBackend>, approval: Arc<dyn reelforge::ApprovalPrompt>) -> SessionContext {
    let mut config = SessionConfig::default();
    config.budget = BudgetPolicy::new(limit);
    SessionContext::new("budget", &config, backend, approval)
}

#[tokio::test]
async fn test_denied_overrun_leaves_ledger_unchanged() {
    let backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let session = session(50.0, backend.clone(), Arc::new(AutoDeny));
    let request = long_video("scene-1");
    assert!((session.cost_guard().estimate(&request.operation) - 60.0).abs() < 1e-9);

    let report = session.generate(&request, false).await;

    assert!(matches!(report.outcome, RequestOutcome::Skipped { .. }));
    let ledger = session.cost_guard().snapshot();
    assert_eq!(ledger.total_cost, 0.0);
    assert_eq!(ledger.request_count, 0);
    assert_eq!(ledger.tokens_consumed, 0);
    assert_eq!(session.cost_guard().reserved(), 0.0);
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn test_approved_overrun_is_committed() {
    let backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let session = session(50.0, backend.clone(), Arc::new(CeilingApproval::new(100.0)));

    let report = session.generate(&long_video("scene-1"), false).await;

    assert!(report.outcome.is_success());
    assert!((session.cost_guard().snapshot().total_cost - 60.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_degrade_strategy_sends_cheaper_tier() {
    let backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let mut config = SessionConfig::default();
    config.budget = BudgetPolicy::new(50.0).with_rejection_strategy(RejectionStrategy::Degrade);
    let session = SessionContext::new("degrade", &config, backend.clone(), Arc::new(AutoDeny));

    let report = session.generate(&long_video("scene-1"), false).await;

    assert!(report.outcome.is_success());
    assert!(report.degraded);
    // Medium tier: 0.50 * 1.0 * 60.
    assert!((report.cost - 30.0).abs() < 1e-9);
}

/// One required stage that wants a single long video.
struct LongVideoStage;

impl Stage for LongVideoStage {
    fn id(&self) -> &str {
        "video"
    }

    fn plan(&self, _ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        Ok(vec![long_video("scene-1")])
    }

    fn finish(&self, _ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        Ok(StageOutput::new(json!({ "clips": results.len() })))
    }
}

#[tokio::test]
async fn test_rejected_stage_records_reason() {
    let backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let session = Arc::new(session(50.0, backend.clone(), Arc::new(AutoDeny)));
    let orchestrator = PipelineOrchestrator::new(
        session.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        Default::default(),
    )
    .with_stages(vec![Arc::new(LongVideoStage) as Arc<dyn Stage>]);

    let outcome = orchestrator.run("storm").await.unwrap();

    assert!(matches!(outcome.status, RunStatus::Failed { ref stage, .. } if stage == "video"));
    let report = &outcome.state.reports[0];
    match &report.status {
        StageStatus::Skipped { reason } => assert!(reason.contains("not approved")),
        other => panic!("unexpected stage status {:?}", other),
    }
    assert_eq!(outcome.ledger.total_cost, 0.0);
    assert_eq!(backend.total_calls(), 0);
}
