//! Checkpoint stores for pipeline state.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::state::PipelineState;

const CHECKPOINT_VERSION: u32 = 1;

/// Errors from saving or loading checkpoints.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint for session {session_id} is corrupted: {reason}")]
    Corrupted { session_id: String, reason: String },

    #[error("invalid session id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidSessionId(String),
}

/// Where pipeline state is persisted between runs.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, state: &PipelineState) -> Result<(), CheckpointError>;

    fn load(&self, session_id: &str) -> Result<Option<PipelineState>, CheckpointError>;

    /// Remove a session's checkpoint. Removing a missing one is not an error.
    fn discard(&self, session_id: &str) -> Result<(), CheckpointError>;
}

/// On-disk wrapper around the serialized state.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEnvelope {
    version: u32,
    session_id: String,
    saved_at: DateTime<Utc>,
    /// Hex SHA-256 of `payload`.
    digest: String,
    payload: String,
}

fn digest_of(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

fn validate_session_id(session_id: &str) -> Result<(), CheckpointError> {
    let valid = !session_id.is_empty()
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidSessionId(session_id.to_string()))
    }
}

/// One JSON file per session under a directory.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// checkpoint, so a crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.checkpoint.json", session_id)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, state: &PipelineState) -> Result<(), CheckpointError> {
        let path = self.path_for(&state.session_id)?;
        let payload = serde_json::to_string(state)?;
        let envelope = CheckpointEnvelope {
            version: CHECKPOINT_VERSION,
            session_id: state.session_id.clone(),
            saved_at: Utc::now(),
            digest: digest_of(&payload),
            payload,
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        debug!(session = %state.session_id, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<PipelineState>, CheckpointError> {
        let path = self.path_for(session_id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let corrupted = |reason: String| CheckpointError::Corrupted {
            session_id: session_id.to_string(),
            reason,
        };
        let envelope: CheckpointEnvelope =
            serde_json::from_str(&contents).map_err(|e| corrupted(e.to_string()))?;
        if envelope.version != CHECKPOINT_VERSION {
            return Err(corrupted(format!("unsupported version {}", envelope.version)));
        }
        if envelope.digest != digest_of(&envelope.payload) {
            return Err(corrupted("digest mismatch".to_string()));
        }
        let state: PipelineState =
            serde_json::from_str(&envelope.payload).map_err(|e| corrupted(e.to_string()))?;
        if state.session_id != session_id {
            return Err(corrupted(format!("belongs to session {}", state.session_id)));
        }
        Ok(Some(state))
    }

    fn discard(&self, session_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-process store, for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: Mutex<HashMap<String, PipelineState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, PipelineState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.states().contains_key(session_id)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, state: &PipelineState) -> Result<(), CheckpointError> {
        self.states().insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<PipelineState>, CheckpointError> {
        Ok(self.states().get(session_id).cloned())
    }

    fn discard(&self, session_id: &str) -> Result<(), CheckpointError> {
        self.states().remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(session_id: &str) -> PipelineState {
        let mut state = PipelineState::new(session_id, "brief", vec!["idea".into(), "script".into()]);
        state.completed_stages.push("idea".into());
        state.current_stage = 1;
        state
    }

    #[test]
    fn test_file_store_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints")).unwrap();

        store.save(&state("session-1")).unwrap();
        let loaded = store.load("session-1").unwrap().unwrap();
        assert_eq!(loaded, state_with_times(&loaded, state("session-1")));
        assert!(!dir
            .path()
            .join("checkpoints/session-1.checkpoint.json.tmp")
            .exists());
    }

    fn state_with_times(loaded: &PipelineState, mut expected: PipelineState) -> PipelineState {
        expected.created_at = loaded.created_at;
        expected.updated_at = loaded.updated_at;
        expected
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        assert!(store.load("nobody").unwrap().is_none());
        store.discard("nobody").unwrap();
    }

    #[test]
    fn test_tampered_checkpoint_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.save(&state("s1")).unwrap();

        let path = store.path_for("s1").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replace("brief", "other")).unwrap();

        assert!(matches!(
            store.load("s1"),
            Err(CheckpointError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.save(&state("s1")).unwrap();
        store.discard("s1").unwrap();
        assert!(store.load("s1").unwrap().is_none());
    }

    #[test]
    fn test_session_id_cannot_escape_directory() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("../etc/passwd"),
            Err(CheckpointError::InvalidSessionId(_))
        ));
        assert!(store.path_for("..").is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        store.save(&state("s1")).unwrap();
        assert!(store.contains("s1"));
        assert_eq!(store.load("s1").unwrap().unwrap().completed_stages, vec!["idea"]);
        store.discard("s1").unwrap();
        assert!(!store.contains("s1"));
    }
}
