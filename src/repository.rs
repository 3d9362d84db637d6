//! CRUD surface over the script store: `save!`, `mv!`, `rm!`, `cat`, `ls`.
//!
//! Every mutation takes the store's write lock, validates against the
//! current table, applies the change to a working copy, flushes that copy
//! through the persistence backend and only then swaps it in. Callers never
//! see a half-applied change, and a failed flush leaves the table untouched.
//!
//! Batch policies differ on purpose:
//! - `save_many` is partial-failure: each item gets its own outcome.
//! - `rm_many` is all-or-nothing: one absent or built-in name rejects the
//!   whole call and nothing is deleted.

use crate::builtins::BUILTIN_SCRIPTS;
use crate::error::{BatchFailure, CrudError, ErrorCode};
use crate::manifest::{Manifest, PatternCache, normalize};
use crate::persistence::{RetryPolicy, ScriptPersistence, persist_with_retry};
use crate::store::{ScriptMetadata, ScriptRecord, ScriptStore};
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};
use url::Url;

/// Options accepted by `save!`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    /// Enabled flag for the saved record. New records default to true, an
    /// overwrite keeps the previous flag when unset.
    pub enabled: Option<bool>,
    /// Permit overwriting an existing non-built-in record
    pub force: bool,
}

/// Options accepted by `mv!`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveOptions {
    /// Recognized but never lets a rename replace an existing record
    pub force: bool,
}

/// Options accepted by `rm!`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveOptions {
    /// Recognized but never overrides built-in protection
    pub force: bool,
    /// Single-name calls resolve with `existed: false` instead of failing
    /// when the name is absent. Batches ignore it.
    pub if_exists: bool,
}

/// Options accepted by `ls`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub include_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    pub success: bool,
    pub name: String,
}

/// Per-item outcome of a batch save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl SaveOutcome {
    fn saved(name: String) -> Self {
        Self {
            success: true,
            name: Some(name),
            error: None,
            code: None,
        }
    }

    fn failed(name: Option<String>, err: &CrudError) -> Self {
        Self {
            success: false,
            name,
            error: Some(err.to_string()),
            code: Some(err.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveResult {
    pub success: bool,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveResult {
    pub success: bool,
    pub name: String,
    pub existed: bool,
}

/// The CRUD engine. Owns the store; nothing else touches it.
pub struct ScriptRepository {
    store: RwLock<ScriptStore>,
    backend: Arc<dyn ScriptPersistence>,
    retry: RetryPolicy,
    patterns: PatternCache,
}

impl ScriptRepository {
    /// Load the persisted table and bring built-ins in line with the shipped
    /// definitions
    pub async fn open(
        backend: Arc<dyn ScriptPersistence>,
        retry: RetryPolicy,
    ) -> Result<Self, CrudError> {
        let records = backend
            .load()
            .await
            .map_err(|source| CrudError::Persistence {
                attempts: 1,
                source,
            })?;
        debug!("Loaded {} script(s) from storage", records.len());

        let repo = Self {
            store: RwLock::new(ScriptStore::from_records(records)),
            backend,
            retry,
            patterns: PatternCache::new(),
        };
        repo.sync_builtins().await?;
        Ok(repo)
    }

    /// Seed missing built-ins and re-sync existing ones to the shipped code.
    ///
    /// The user's enabled flag on a built-in survives the re-sync. Returns the
    /// number of records that changed.
    pub async fn sync_builtins(&self) -> Result<usize, CrudError> {
        let mut guard = self.store.write().await;
        let mut working = guard.clone();
        let mut changed = 0;

        for builtin in BUILTIN_SCRIPTS {
            let mut shipped = builtin.to_record()?;

            // Shipped scripts may have been renamed between releases
            let stale: Vec<String> = working
                .list(true)
                .iter()
                .filter(|r| r.id == shipped.id && r.name != shipped.name)
                .map(|r| r.name.clone())
                .collect();
            for name in stale {
                working.remove(&name);
                changed += 1;
            }

            match working.get(&shipped.name) {
                Some(existing) if existing.builtin && existing.id == shipped.id => {
                    if existing.code == shipped.code && existing.hidden == shipped.hidden {
                        continue;
                    }
                    shipped.enabled = existing.enabled;
                    shipped.created_at = existing.created_at;
                    working.remove(&shipped.name);
                }
                Some(existing) => {
                    warn!(
                        name = %existing.name,
                        id = %existing.id,
                        "Replacing record that occupies a built-in name"
                    );
                    working.remove(&shipped.name);
                }
                None => {}
            }

            info!(name = %shipped.name, id = %shipped.id, "Syncing built-in script");
            working
                .insert_new(shipped)
                .map_err(|e| CrudError::validation("builtin", e.to_string()))?;
            changed += 1;
        }

        if changed > 0 {
            self.commit(&mut guard, working).await?;
        }
        Ok(changed)
    }

    /// `save!` for a single script
    pub async fn save(&self, code: &str, options: &SaveOptions) -> Result<SaveResult, CrudError> {
        let mut guard = self.store.write().await;
        let mut working = guard.clone();

        let name = apply_save(&mut working, code, options)?;
        self.commit(&mut guard, working).await?;

        info!(name = %name, force = options.force, "Saved script");
        Ok(SaveResult {
            success: true,
            name,
        })
    }

    /// `save!` for a list of scripts.
    ///
    /// Items are applied in order, so a later item sees earlier successes of
    /// the same batch. A failing item never blocks the others. The call only
    /// errors when the final flush fails, in which case nothing is saved.
    pub async fn save_many(
        &self,
        codes: &[String],
        options: &SaveOptions,
    ) -> Result<BTreeMap<usize, SaveOutcome>, CrudError> {
        let mut guard = self.store.write().await;
        let mut working = guard.clone();
        let mut outcomes = BTreeMap::new();
        let mut saved = 0;

        for (index, code) in codes.iter().enumerate() {
            let outcome = match apply_save(&mut working, code, options) {
                Ok(name) => {
                    saved += 1;
                    SaveOutcome::saved(name)
                }
                Err(e) => {
                    let name = Manifest::parse(code)
                        .ok()
                        .and_then(|m| m.script_name().ok());
                    debug!(index, "Batch save item failed: {}", e);
                    SaveOutcome::failed(name, &e)
                }
            };
            outcomes.insert(index, outcome);
        }

        if saved > 0 {
            self.commit(&mut guard, working).await?;
        }
        info!(saved, total = codes.len(), "Batch save finished");
        Ok(outcomes)
    }

    /// `mv!`: rename without touching content
    pub async fn mv(
        &self,
        from: &str,
        to: &str,
        options: &MoveOptions,
    ) -> Result<MoveResult, CrudError> {
        let mut guard = self.store.write().await;
        let mut working = guard.clone();

        let from_key = normalize(from).map_err(|_| CrudError::NotFound {
            name: from.to_string(),
        })?;
        let to_key = normalize(to)?;

        let mut record = match working.get(&from_key) {
            Some(r) if r.builtin => return Err(CrudError::builtin(from_key, "rename")),
            Some(r) => r.clone(),
            None => return Err(CrudError::NotFound { name: from_key }),
        };

        if let Some(target) = working.get(&to_key) {
            if target.builtin {
                return Err(CrudError::builtin(to_key, "overwrite"));
            }
            if options.force {
                debug!(to = %to_key, "force does not let a rename replace a record");
            }
            return Err(CrudError::AlreadyExists { name: to_key });
        }

        working.remove(&from_key);
        record.name = to_key.clone();
        record.modified_at = Utc::now();
        working
            .insert_new(record)
            .map_err(|_| CrudError::AlreadyExists {
                name: to_key.clone(),
            })?;
        self.commit(&mut guard, working).await?;

        info!(from = %from_key, to = %to_key, "Renamed script");
        Ok(MoveResult {
            success: true,
            from: from_key,
            to: to_key,
        })
    }

    /// `rm!` for a single name
    pub async fn rm(&self, name: &str, options: &RemoveOptions) -> Result<RemoveResult, CrudError> {
        let mut guard = self.store.write().await;
        let key = normalize(name).unwrap_or_else(|_| name.to_string());

        match guard.get(&key) {
            Some(r) if r.builtin => {
                if options.force {
                    warn!(name = %key, "force does not apply to built-in scripts");
                }
                return Err(CrudError::builtin(key, "delete"));
            }
            Some(_) => {}
            None if options.if_exists => {
                return Ok(RemoveResult {
                    success: true,
                    name: key,
                    existed: false,
                });
            }
            None => return Err(CrudError::NotFound { name: key }),
        }

        let mut working = guard.clone();
        working.remove(&key);
        self.commit(&mut guard, working).await?;

        info!(name = %key, "Deleted script");
        Ok(RemoveResult {
            success: true,
            name: key,
            existed: true,
        })
    }

    /// `rm!` for a list of names. All-or-nothing.
    pub async fn rm_many(
        &self,
        names: &[String],
        options: &RemoveOptions,
    ) -> Result<IndexMap<String, RemoveResult>, CrudError> {
        let mut guard = self.store.write().await;

        let keyed: Vec<(String, String)> = names
            .iter()
            .map(|n| (n.clone(), normalize(n).unwrap_or_else(|_| n.clone())))
            .collect();

        let mut failures = Vec::new();
        for (_, key) in &keyed {
            if failures.iter().any(|f: &BatchFailure| &f.name == key) {
                continue;
            }
            match guard.get(key) {
                Some(r) if r.builtin => failures.push(BatchFailure {
                    name: key.clone(),
                    code: ErrorCode::BuiltinProtected,
                    reason: "built-in".to_string(),
                }),
                Some(_) => {}
                None => failures.push(BatchFailure {
                    name: key.clone(),
                    code: ErrorCode::NotFound,
                    reason: "not found".to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            if options.force {
                debug!("force does not relax batch removal checks");
            }
            warn!(rejected = failures.len(), "Batch delete rejected");
            return Err(CrudError::BatchRejected { failures });
        }

        let mut working = guard.clone();
        let mut results = IndexMap::new();
        for (requested, key) in keyed {
            working.remove(&key);
            results.insert(
                requested,
                RemoveResult {
                    success: true,
                    name: key,
                    existed: true,
                },
            );
        }

        if !results.is_empty() {
            self.commit(&mut guard, working).await?;
        }
        info!(deleted = results.len(), "Batch delete finished");
        Ok(results)
    }

    /// `cat` for a single name. Absence is not an error.
    pub async fn cat(&self, name: &str) -> Option<String> {
        let key = normalize(name).ok()?;
        self.store.read().await.get(&key).map(|r| r.code.clone())
    }

    /// `cat` for a list of names, keyed by the names as requested
    pub async fn cat_many(&self, names: &[String]) -> IndexMap<String, Option<String>> {
        let store = self.store.read().await;
        names
            .iter()
            .map(|n| {
                let code = normalize(n)
                    .ok()
                    .and_then(|key| store.get(&key).map(|r| r.code.clone()));
                (n.clone(), code)
            })
            .collect()
    }

    pub async fn ls(&self, options: &ListOptions) -> Vec<ScriptMetadata> {
        self.store
            .read()
            .await
            .list(options.include_hidden)
            .into_iter()
            .map(ScriptRecord::metadata)
            .collect()
    }

    /// Full record lookup, for callers inside the service
    pub async fn get(&self, name: &str) -> Option<ScriptRecord> {
        let key = normalize(name).ok()?;
        self.store.read().await.get(&key).cloned()
    }

    /// Toggle a script on or off. Built-ins may be toggled.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<ScriptMetadata, CrudError> {
        let mut guard = self.store.write().await;
        let key = normalize(name).unwrap_or_else(|_| name.to_string());
        let mut working = guard.clone();

        let record = working
            .get_mut(&key)
            .ok_or_else(|| CrudError::NotFound { name: key.clone() })?;
        if record.enabled == enabled {
            return Ok(record.metadata());
        }
        record.enabled = enabled;
        record.modified_at = Utc::now();
        let metadata = record.metadata();

        self.commit(&mut guard, working).await?;
        info!(name = %key, enabled, "Toggled script");
        Ok(metadata)
    }

    /// Enabled scripts whose match patterns cover `url`, in injection order
    pub async fn scripts_for_url(&self, url: &str) -> Result<Vec<ScriptRecord>, CrudError> {
        let url = Url::parse(url).map_err(|e| CrudError::validation("url", e.to_string()))?;
        let store = self.store.read().await;

        let mut matching: Vec<ScriptRecord> = store
            .list(true)
            .into_iter()
            .filter(|r| r.enabled)
            .filter(|r| {
                r.matches.iter().any(|p| match self.patterns.get(p) {
                    Ok(pattern) => pattern.matches(&url),
                    Err(e) => {
                        warn!(name = %r.name, pattern = %p, "Skipping bad match pattern: {}", e);
                        false
                    }
                })
            })
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.run_at);
        Ok(matching)
    }

    async fn commit(
        &self,
        guard: &mut RwLockWriteGuard<'_, ScriptStore>,
        working: ScriptStore,
    ) -> Result<(), CrudError> {
        persist_with_retry(self.backend.as_ref(), &working.snapshot(), self.retry).await?;
        self.patterns.retain(
            working
                .list(true)
                .into_iter()
                .flat_map(|r| r.matches.iter().map(String::as_str)),
        );
        **guard = working;
        Ok(())
    }
}

/// Validate `code` against `store` and write it. Returns the saved name.
fn apply_save(
    store: &mut ScriptStore,
    code: &str,
    options: &SaveOptions,
) -> Result<String, CrudError> {
    let manifest = Manifest::parse(code)?;
    let name = manifest.script_name()?;

    let previous = match store.get(&name) {
        Some(existing) if existing.builtin => {
            return Err(CrudError::builtin(name, "overwrite"));
        }
        Some(_) if !options.force => return Err(CrudError::AlreadyExists { name }),
        Some(existing) => Some(existing.clone()),
        None => None,
    };

    match previous {
        Some(previous) => {
            let enabled = options.enabled.unwrap_or(previous.enabled);
            let mut record = ScriptRecord::from_manifest(name.clone(), code.to_string(), manifest, enabled);
            record.id = previous.id;
            record.created_at = previous.created_at;
            store
                .replace(record)
                .map_err(|e| CrudError::validation("name", e.to_string()))?;
        }
        None => {
            let enabled = options.enabled.unwrap_or(true);
            let record = ScriptRecord::from_manifest(name.clone(), code.to_string(), manifest, enabled);
            store
                .insert_new(record)
                .map_err(|_| CrudError::AlreadyExists { name: name.clone() })?;
        }
    }

    Ok(name)
}
