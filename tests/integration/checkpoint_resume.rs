//! Resuming an eight-stage pipeline from a file checkpoint.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reelforge::budget::AutoDeny;
use reelforge::pipeline::{
    CheckpointStore, FileCheckpointStore, PipelineHandle, PipelineOrchestrator, RunStatus, Stage,
};
use reelforge::{SessionConfig, SessionContext};
use tempfile::TempDir;

use crate::common::{CountingBackend, StepStage};

const STAGES: usize = 8;

fn stages(pause_after_third: Option<&'static OnceLock<PipelineHandle>>) -> Vec<Arc<dyn Stage>> {
    (1..=STAGES)
        .map(|n| {
            let stage = StepStage::new(n);
            let stage = match pause_after_third {
                Some(handle) if n == 3 => stage.pausing(handle),
                _ => stage,
            };
            Arc::new(stage) as Arc<dyn Stage>
        })
        .collect()
}

fn orchestrator(
    session_id: &str,
    backend: Arc<CountingBackend>,
    store: Arc<dyn CheckpointStore>,
    stages: Vec<Arc<dyn Stage>>,
) -> PipelineOrchestrator {
    let config = SessionConfig::default();
    let session = Arc::new(SessionContext::new(session_id, &config, backend, Arc::new(AutoDeny)));
    PipelineOrchestrator::new(session, store, config.pipeline.clone()).with_stages(stages)
}

#[tokio::test]
async fn test_resume_after_stage_three_matches_uninterrupted_run() {
    static HANDLE: OnceLock<PipelineHandle> = OnceLock::new();

    // Reference run without interruption.
    let reference_dir = TempDir::new().expect("Failed to create temp dir");
    let reference_backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let reference = orchestrator(
        "reference",
        reference_backend.clone(),
        Arc::new(FileCheckpointStore::new(reference_dir.path()).unwrap()),
        stages(None),
    )
    .run("eight steps")
    .await
    .unwrap();
    assert_eq!(reference.status, RunStatus::Completed);

    // Same pipeline, paused once stage three has finished.
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()).unwrap());
    let backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let first = orchestrator("interrupted", backend.clone(), store.clone(), stages(Some(&HANDLE)));
    HANDLE.set(first.handle()).expect("handle set once");

    let paused = first.run("eight steps").await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.completed_stages(), &["step-1", "step-2", "step-3"]);
    assert!(dir.path().join("interrupted.checkpoint.json").exists());
    assert_eq!(backend.total_calls(), 6);

    // A fresh session, as after a restart, picks the run up from disk.
    let second = orchestrator("interrupted", backend.clone(), store.clone(), stages(None));
    let resumed = second.resume().await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.completed_stages(), reference.completed_stages());
    for n in 1..=STAGES {
        for suffix in ["a", "b"] {
            let id = format!("step-{}-{}", n, suffix);
            assert_eq!(backend.calls_for(&id), 1, "{} executed {} times", id, backend.calls_for(&id));
        }
    }
    assert_eq!(backend.total_calls(), reference_backend.total_calls());
    assert_eq!(resumed.ledger.request_count, reference.ledger.request_count);
    assert!((resumed.ledger.total_cost - reference.ledger.total_cost).abs() < 1e-9);
    assert!(!dir.path().join("interrupted.checkpoint.json").exists());
}

#[tokio::test]
async fn test_resume_without_checkpoint_is_an_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()).unwrap());
    let orchestrator = orchestrator("missing", Arc::new(CountingBackend::default()), store, stages(None));

    let err = orchestrator.resume().await.unwrap_err();
    assert!(err.to_string().contains("no checkpoint"));
}
