//! Canonical, name-keyed script table
//!
//! The store only knows about keys: it refuses to insert over an existing
//! key and refuses to replace a missing one. Protection of built-ins and
//! collision reporting live in the repository layer.

use crate::manifest::{Manifest, RunAt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Prefix of the stable id of every shipped script
pub const BUILTIN_ID_PREFIX: &str = "builtin:";

/// A stored userscript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub code: String,
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub run_at: RunAt,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inject: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub builtin: bool,
    #[serde(default)]
    pub hidden: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ScriptRecord {
    /// Build a user record from already parsed code
    pub fn from_manifest(name: String, code: String, manifest: Manifest, enabled: bool) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            display_name: manifest.display_name,
            code,
            matches: manifest.matches,
            description: manifest.description,
            run_at: manifest.run_at,
            inject: manifest.inject,
            enabled,
            builtin: false,
            hidden: false,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn metadata(&self) -> ScriptMetadata {
        ScriptMetadata {
            name: self.name.clone(),
            enabled: self.enabled,
            matches: self.matches.clone(),
            builtin: self.builtin,
            inject: self.inject.clone(),
            description: self.description.clone(),
            run_at: self.run_at,
        }
    }
}

/// Listing shape returned by `ls`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    pub builtin: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inject: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub run_at: RunAt,
}

/// Raised when a raw write would break key uniqueness
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key '{0}' is already taken")]
    Taken(String),
    #[error("key '{0}' is not present")]
    Missing(String),
}

/// Name-keyed table of script records, ordered by name
#[derive(Debug, Clone, Default)]
pub struct ScriptStore {
    records: BTreeMap<String, ScriptRecord>,
}

impl ScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from a persisted snapshot. Later duplicates of a key
    /// are dropped.
    pub fn from_records(records: Vec<ScriptRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            if let Err(e) = store.insert_new(record) {
                tracing::warn!("Dropping duplicate record from snapshot: {}", e);
            }
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<&ScriptRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in name order, hidden ones only on request
    pub fn list(&self, include_hidden: bool) -> Vec<&ScriptRecord> {
        self.records
            .values()
            .filter(|r| include_hidden || !r.hidden)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ScriptRecord> {
        self.records.values().cloned().collect()
    }

    pub(crate) fn insert_new(&mut self, record: ScriptRecord) -> Result<(), KeyError> {
        match self.records.entry(record.name.clone()) {
            Entry::Occupied(e) => Err(KeyError::Taken(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(record);
                Ok(())
            }
        }
    }

    pub(crate) fn replace(&mut self, record: ScriptRecord) -> Result<ScriptRecord, KeyError> {
        match self.records.get_mut(&record.name) {
            Some(slot) => Ok(std::mem::replace(slot, record)),
            None => Err(KeyError::Missing(record.name)),
        }
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<ScriptRecord> {
        self.records.remove(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut ScriptRecord> {
        self.records.get_mut(key)
    }
}
