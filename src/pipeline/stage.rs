//! The stage seam.
//!
//! A stage does not talk to the backend itself. It plans the requests it
//! needs, the orchestrator sends them (rate limited, budgeted, retried),
//! and the stage then folds the results into its output. Keeping stages
//! synchronous keeps them trivially resumable: planning is repeatable and
//! finished requests are skipped by id.

use serde::{Deserialize, Serialize};

use super::state::PipelineState;
use super::{PipelineConfig, PipelineError};
use crate::backend::{Complexity, GenerationRequest, MediaResult};
use crate::characters::SharedCharacterStore;

/// Per-stage overrides from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub model: Option<String>,
    pub complexity: Option<Complexity>,
    /// Input size attached to each request of the stage.
    pub input_size: Option<u64>,
}

/// What a stage can see while planning and finishing.
pub struct StageContext<'a> {
    pub stage_id: &'a str,
    pub state: &'a PipelineState,
    pub characters: &'a SharedCharacterStore,
    pub config: &'a PipelineConfig,
}

impl<'a> StageContext<'a> {
    pub fn settings(&self) -> StageSettings {
        self.config.settings_for(self.stage_id)
    }

    pub fn model_or(&self, default: &str) -> String {
        self.settings().model.unwrap_or_else(|| default.to_string())
    }

    /// Output of an earlier stage, or a stage error naming what is missing.
    pub fn require_output(&self, stage_id: &str) -> Result<&'a serde_json::Value, PipelineError> {
        self.state.output(stage_id).ok_or_else(|| PipelineError::Stage {
            stage: self.stage_id.to_string(),
            message: format!("missing output of stage '{}'", stage_id),
        })
    }

    pub fn error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::Stage {
            stage: self.stage_id.to_string(),
            message: message.into(),
        }
    }
}

/// Result of a finished stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub value: serde_json::Value,
    /// Non-fatal findings, e.g. character description conflicts.
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// One step of the pipeline.
pub trait Stage: Send + Sync {
    /// Stable id; also the key of the stage's output in the state.
    fn id(&self) -> &str;

    /// Requests this stage needs. Must return the same ids when called again
    /// for the same state, so a resumed stage can skip finished requests.
    fn plan(&self, ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError>;

    /// Build the stage output from the results of every planned request, in
    /// planning order.
    fn finish(&self, ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError>;
}
