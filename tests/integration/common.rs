//! Shared fixtures: a counting backend and a simple numbered stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reelforge::backend::{GenerationBackend, GenerationOperation, GenerationRequest, MediaKind, MediaResult};
use reelforge::pipeline::{PipelineError, PipelineHandle, Stage, StageContext, StageOutput};
use reelforge::GenerationError;
use serde_json::json;

/// Backend that records every call and the highest number of calls in
/// flight at once.
#[derive(Default)]
pub struct CountingBackend {
    latency: Duration,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn calls_for(&self, request_id: &str) -> u32 {
        self.calls.lock().unwrap().get(request_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<MediaResult, GenerationError> {
        *self.calls.lock().unwrap().entry(request.id.clone()).or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(match request.operation.kind {
            MediaKind::Text => MediaResult::text(&request.id, format!("text for {}", request.id)),
            kind => MediaResult::asset(&request.id, kind, format!("asset://{}", request.id)),
        })
    }
}

/// Stage `step-N` sending two text requests. Optionally pauses the
/// pipeline once it has finished.
pub struct StepStage {
    id: String,
    pause_after: Option<&'static OnceLock<PipelineHandle>>,
}

impl StepStage {
    pub fn new(n: usize) -> Self {
        Self {
            id: format!("step-{}", n),
            pause_after: None,
        }
    }

    pub fn pausing(mut self, handle: &'static OnceLock<PipelineHandle>) -> Self {
        self.pause_after = Some(handle);
        self
    }
}

impl Stage for StepStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn plan(&self, ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        Ok(["a", "b"]
            .iter()
            .map(|suffix| {
                GenerationRequest::new(
                    format!("{}-{}", ctx.stage_id, suffix),
                    GenerationOperation::new(MediaKind::Text, "writer"),
                    format!("work for {}", ctx.stage_id),
                )
            })
            .collect())
    }

    fn finish(&self, _ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        if let Some(handle) = self.pause_after.and_then(OnceLock::get) {
            handle.pause();
        }
        let texts: Vec<_> = results.iter().map(|r| r.text.clone()).collect();
        Ok(StageOutput::new(json!({ "texts": texts })))
    }
}
