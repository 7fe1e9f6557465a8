//! Simulated backend for dry runs and local testing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{GenerationBackend, GenerationRequest, MediaKind, MediaResult};
use crate::error::GenerationError;

/// Backend that fabricates plausible results without contacting any vendor.
///
/// Script requests (`purpose = "script"`) get a structured JSON script with
/// `scenes` scenes so the downstream stages have something to fan out over.
#[derive(Debug)]
pub struct DryRunBackend {
    latency: Duration,
    scenes: usize,
    calls: AtomicU64,
}

impl Default for DryRunBackend {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl DryRunBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            scenes: 3,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of scenes in generated scripts.
    pub fn with_scenes(mut self, scenes: usize) -> Self {
        self.scenes = scenes.max(1);
        self
    }

    /// Total calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn script_json(&self) -> String {
        let scenes: Vec<_> = (1..=self.scenes)
            .map(|n| {
                json!({
                    "description": format!("Scene {} of the dry run", n),
                    "characters": ["Narrator"],
                    "narration": format!("Narration for scene {}", n),
                })
            })
            .collect();
        json!({
            "title": "Dry run",
            "characters": [
                { "name": "Narrator", "description": "calm voice, grey coat, round glasses" }
            ],
            "scenes": scenes,
        })
        .to_string()
    }
}

#[async_trait]
impl GenerationBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<MediaResult, GenerationError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let tokens = (request.prompt.len() as u64 / 4).max(1);
        let result = match request.operation.kind {
            MediaKind::Text => {
                let text = match request.purpose() {
                    Some("script") => self.script_json(),
                    _ => format!("dry-run text for {}", request.id),
                };
                MediaResult::text(&request.id, text)
            }
            kind => MediaResult::asset(&request.id, kind, format!("dry-run://{}/{}/{}", kind, request.id, n)),
        };
        Ok(result.with_tokens(tokens))
    }
}
