//! Staged content pipeline.
//!
//! Stages run in a fixed order. Each stage plans its backend requests, the
//! [`PipelineOrchestrator`] sends them through the session (budget, retry,
//! rate limit) up to the concurrency ceiling, and the stage folds the
//! results into an output that later stages read. State is checkpointed
//! after every stage and whenever a run stops early.

pub mod checkpoint;
pub mod orchestrator;
pub mod progress;
pub mod script;
pub mod stage;
pub mod stages;
pub mod state;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use orchestrator::{PipelineHandle, PipelineOrchestrator, PipelineOutcome, RunStatus};
pub use progress::{ProgressEvent, ProgressKind, ProgressReporter};
pub use script::{parse_script, ParsedScript, Scene, Script, ScriptCharacter};
pub use stage::{Stage, StageContext, StageOutput, StageSettings};
pub use stages::default_stages;
pub use state::{PipelineState, StageReport, StageStatus};

/// Errors that stop a pipeline from running at all. Request and budget
/// failures are not errors here; they show up in the outcome.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stage '{stage}': {message}")]
    Stage { stage: String, message: String },

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("checkpoint stages {found:?} do not match pipeline stages {expected:?}")]
    StageMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("no checkpoint for session {0}")]
    NoCheckpoint(String),

    #[error("pipeline has no stages")]
    Empty,
}

fn default_optional_stages() -> Vec<String> {
    vec![stages::CHARACTER_REFS.to_string(), stages::AUDIO.to_string()]
}

/// Pipeline section of the session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on scenes taken from a script.
    pub max_scenes: usize,
    /// Stages whose skip or failure does not halt the run.
    pub optional_stages: Vec<String>,
    pub checkpoint_dir: PathBuf,
    /// Per-stage overrides keyed by stage id.
    pub stages: BTreeMap<String, StageSettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_scenes: 8,
            optional_stages: default_optional_stages(),
            checkpoint_dir: PathBuf::from(".reelforge/checkpoints"),
            stages: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn settings_for(&self, stage_id: &str) -> StageSettings {
        self.stages.get(stage_id).cloned().unwrap_or_default()
    }

    pub fn is_required(&self, stage_id: &str) -> bool {
        !self.optional_stages.iter().any(|s| s == stage_id)
    }

    pub fn with_max_scenes(mut self, max_scenes: usize) -> Self {
        self.max_scenes = max_scenes;
        self
    }

    pub fn with_optional_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stage_settings(mut self, stage_id: impl Into<String>, settings: StageSettings) -> Self {
        self.stages.insert(stage_id.into(), settings);
        self
    }
}
