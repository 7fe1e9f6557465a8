//! Persistent pipeline state.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::MediaResult;
use crate::budget::UsageLedger;
use crate::characters::CharacterConsistencyStore;

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Not run, or not finished, because the budget gate turned it down.
    Skipped { reason: String },
    Failed { reason: String },
}

/// Record of one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage_id: String,
    pub required: bool,
    #[serde(flatten)]
    pub status: StageStatus,
    pub requests_succeeded: u32,
    pub requests_failed: u32,
    pub requests_skipped: u32,
    pub cost: f64,
    pub duration: Duration,
}

/// Everything needed to pick a run up where it stopped.
///
/// Mutated only by the orchestrator. Saved after every stage and whenever a
/// run stops early; discarded once the run completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub session_id: String,
    /// What the pipeline is producing, handed to the first stage.
    pub brief: String,
    /// Stage ids in execution order.
    pub stages: Vec<String>,
    /// Index into `stages` of the next stage to run.
    pub current_stage: usize,
    pub completed_stages: Vec<String>,
    /// Optional stages passed over, in order.
    #[serde(default)]
    pub skipped_stages: Vec<String>,
    pub current_stage_progress: f64,
    pub overall_progress: f64,
    /// Output of each completed stage, keyed by stage id.
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Finished requests of the current stage, keyed by request id.
    #[serde(default)]
    pub partial_results: BTreeMap<String, MediaResult>,
    #[serde(default)]
    pub reports: Vec<StageReport>,
    pub ledger: UsageLedger,
    pub characters: CharacterConsistencyStore,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(session_id: impl Into<String>, brief: impl Into<String>, stages: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            brief: brief.into(),
            stages,
            current_stage: 0,
            completed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            current_stage_progress: 0.0,
            overall_progress: 0.0,
            outputs: BTreeMap::new(),
            partial_results: BTreeMap::new(),
            reports: Vec::new(),
            ledger: UsageLedger::default(),
            characters: CharacterConsistencyStore::default(),
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_stages(&self) -> usize {
        self.stages.len()
    }

    /// Id of the stage that runs next, `None` once every stage is done.
    pub fn current_stage_id(&self) -> Option<&str> {
        self.stages.get(self.current_stage).map(String::as_str)
    }

    pub fn is_finished(&self) -> bool {
        self.current_stage >= self.stages.len()
    }

    pub fn output(&self, stage_id: &str) -> Option<&serde_json::Value> {
        self.outputs.get(stage_id)
    }

    /// Update progress for the current stage. `done` of `total` requests.
    pub fn set_stage_progress(&mut self, done: usize, total: usize) {
        self.current_stage_progress = if total == 0 {
            1.0
        } else {
            (done as f64 / total as f64).clamp(0.0, 1.0)
        };
        self.refresh_overall();
    }

    /// Move past the current stage.
    pub fn advance(&mut self) {
        self.current_stage += 1;
        self.current_stage_progress = 0.0;
        self.partial_results.clear();
        self.refresh_overall();
    }

    fn refresh_overall(&mut self) {
        let total = self.stages.len();
        self.overall_progress = if total == 0 {
            1.0
        } else {
            ((self.current_stage.min(total) as f64 + self.current_stage_progress) / total as f64).min(1.0)
        };
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
