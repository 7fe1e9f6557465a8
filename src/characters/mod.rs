//! Character consistency across generated scenes.
//!
//! Every character that appears in a script gets one [`CharacterRecord`]
//! keyed by name. Stages that render a character pull its description from
//! here so the same person looks the same in every scene. Records are
//! updated in place and never deleted during a session; a description that
//! changes materially is reported as a [`DescriptionConflict`] rather than
//! overwritten silently.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One character known to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    pub description: String,
    /// Reference image produced by the character reference stage.
    pub reference_asset_ref: Option<String>,
    /// Stage ids the character appeared in, in first-appearance order.
    pub appearances: Vec<String>,
    /// Descriptions replaced by later conflicting upserts, oldest first.
    #[serde(default)]
    pub previous_descriptions: Vec<String>,
}

impl CharacterRecord {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            reference_asset_ref: None,
            appearances: Vec::new(),
            previous_descriptions: Vec::new(),
        }
    }
}

/// Signal that an upsert changed a character's description materially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionConflict {
    pub name: String,
    pub previous: String,
    pub incoming: String,
}

/// Result of [`CharacterConsistencyStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub record: CharacterRecord,
    pub conflict: Option<DescriptionConflict>,
}

/// Keyed character descriptions for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterConsistencyStore {
    records: BTreeMap<String, CharacterRecord>,
}

impl CharacterConsistencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a character.
    ///
    /// A description that differs from the stored one only in case,
    /// whitespace or trailing punctuation is not a change. Any other
    /// difference replaces the description, keeps the old one in
    /// `previous_descriptions` and returns a conflict.
    pub fn upsert(&mut self, name: &str, description: &str) -> UpsertOutcome {
        let name = name.trim();
        let description = description.trim();

        let Some(record) = self.records.get_mut(name) else {
            let record = CharacterRecord::new(name, description);
            self.records.insert(name.to_string(), record.clone());
            return UpsertOutcome {
                record,
                conflict: None,
            };
        };

        if description.is_empty() || normalize(&record.description) == normalize(description) {
            return UpsertOutcome {
                record: record.clone(),
                conflict: None,
            };
        }

        let conflict = DescriptionConflict {
            name: name.to_string(),
            previous: record.description.clone(),
            incoming: description.to_string(),
        };
        warn!(
            character = %name,
            previous = %conflict.previous,
            incoming = %conflict.incoming,
            "character description changed"
        );
        let previous = std::mem::replace(&mut record.description, description.to_string());
        record.previous_descriptions.push(previous);
        UpsertOutcome {
            record: record.clone(),
            conflict: Some(conflict),
        }
    }

    /// Descriptions for `names`, in the order given. Unknown names are
    /// skipped.
    pub fn get(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .filter_map(|name| self.records.get(name.trim()))
            .map(|record| record.description.clone())
            .collect()
    }

    pub fn record(&self, name: &str) -> Option<&CharacterRecord> {
        self.records.get(name.trim())
    }

    /// `Name: description` lines for prompt injection, in the order given.
    pub fn prompt_fragment(&self, names: &[&str]) -> String {
        names
            .iter()
            .filter_map(|name| self.records.get(name.trim()))
            .map(|record| format!("{}: {}", record.name, record.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Note that `name` appeared in `stage_id`. Repeats are ignored. Returns
    /// false for unknown characters.
    pub fn record_appearance(&mut self, name: &str, stage_id: &str) -> bool {
        match self.records.get_mut(name.trim()) {
            Some(record) => {
                if !record.appearances.iter().any(|s| s == stage_id) {
                    record.appearances.push(stage_id.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub fn set_reference_asset(&mut self, name: &str, asset_ref: impl Into<String>) -> bool {
        match self.records.get_mut(name.trim()) {
            Some(record) => {
                record.reference_asset_ref = Some(asset_ref.into());
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Case, whitespace and trailing punctuation do not make a description
/// different.
fn normalize(description: &str) -> String {
    description
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

/// Session-wide handle to a [`CharacterConsistencyStore`].
#[derive(Debug, Clone, Default)]
pub struct SharedCharacterStore {
    inner: Arc<RwLock<CharacterConsistencyStore>>,
}

impl SharedCharacterStore {
    pub fn new(store: CharacterConsistencyStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, CharacterConsistencyStore> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, CharacterConsistencyStore> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn upsert(&self, name: &str, description: &str) -> UpsertOutcome {
        self.write().upsert(name, description)
    }

    pub fn get(&self, names: &[&str]) -> Vec<String> {
        self.read().get(names)
    }

    pub fn record_appearance(&self, name: &str, stage_id: &str) -> bool {
        self.write().record_appearance(name, stage_id)
    }

    pub fn snapshot(&self) -> CharacterConsistencyStore {
        self.read().clone()
    }

    pub fn restore(&self, store: CharacterConsistencyStore) {
        *self.write() = store;
    }
}
