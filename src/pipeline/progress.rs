//! Progress events emitted while a pipeline runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// What just happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    StageStarted,
    RequestFinished { request_id: String, success: bool },
    StageFinished,
    StageSkipped { reason: String },
    Paused,
    Aborted,
    Completed,
    Failed { reason: String },
}

/// Snapshot of pipeline progress. Carries data only; rendering it is the
/// receiver's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub kind: ProgressKind,
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub current_stage_progress: f64,
    pub overall_progress: f64,
    pub estimated_time_remaining: Option<Duration>,
}

/// Non-blocking sender side of the progress channel.
///
/// A full or closed channel drops the event; progress never slows the
/// pipeline down.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sender: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new(sender: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// A reporter and the receiver for its events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            if let Err(err) = sender.try_send(event) {
                trace!(error = %err, "progress event dropped");
            }
        }
    }
}
