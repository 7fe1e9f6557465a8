//! Generation backend seam.
//!
//! The core never talks to a vendor API directly. It hands a
//! [`GenerationRequest`] to a [`GenerationBackend`] and gets back either a
//! [`MediaResult`] or a classified [`GenerationError`].

mod dry_run;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

pub use dry_run::DryRunBackend;

/// Media kind produced by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Text,
    Image,
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MediaKind::Text => "text",
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        };
        f.write_str(label)
    }
}

/// Relative effort of an operation; scales its estimated cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// One step cheaper, or `None` when already at the floor.
    pub fn lower(self) -> Option<Self> {
        match self {
            Complexity::High => Some(Complexity::Medium),
            Complexity::Medium => Some(Complexity::Low),
            Complexity::Low => None,
        }
    }
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Medium
    }
}

/// Description of one billable backend call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOperation {
    pub kind: MediaKind,
    pub model: String,
    /// Input size in backend units (characters of prompt, seconds of media).
    pub input_size: u64,
    pub complexity: Complexity,
}

impl GenerationOperation {
    pub fn new(kind: MediaKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            input_size: 0,
            complexity: Complexity::default(),
        }
    }

    pub fn with_input_size(mut self, input_size: u64) -> Self {
        self.input_size = input_size;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// The same operation one complexity step lower, if there is one.
    pub fn degraded(&self) -> Option<Self> {
        self.complexity.lower().map(|complexity| Self {
            complexity,
            ..self.clone()
        })
    }
}

/// A request issued by a pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Stable id within its stage; used to skip finished work on resume.
    pub id: String,
    pub operation: GenerationOperation,
    pub prompt: String,
    /// Backend-specific parameters passed through untouched.
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(
        id: impl Into<String>,
        operation: GenerationOperation,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            operation,
            prompt: prompt.into(),
            extras: serde_json::Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// The `purpose` extra, used by backends to pick a response shape.
    pub fn purpose(&self) -> Option<&str> {
        self.extras.get("purpose").and_then(|v| v.as_str())
    }
}

/// What a backend returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaResult {
    pub request_id: String,
    pub kind: MediaKind,
    /// Opaque reference into the external media store.
    pub asset_ref: Option<String>,
    /// Text payload for text operations.
    pub text: Option<String>,
    pub tokens_used: u64,
    /// Actual cost reported by the backend; the estimate is used when absent.
    pub cost: Option<f64>,
}

impl MediaResult {
    pub fn text(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            kind: MediaKind::Text,
            asset_ref: None,
            text: Some(text.into()),
            tokens_used: 0,
            cost: None,
        }
    }

    pub fn asset(request_id: impl Into<String>, kind: MediaKind, asset_ref: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            kind,
            asset_ref: Some(asset_ref.into()),
            text: None,
            tokens_used: 0,
            cost: None,
        }
    }

    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// External generation backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Perform one attempt of a generation call.
    async fn generate(&self, request: &GenerationRequest) -> Result<MediaResult, GenerationError>;
}
