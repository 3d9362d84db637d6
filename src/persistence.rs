use crate::error::{CrudError, StoreError};
use crate::store::ScriptRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// Backend the script table is flushed to after every mutation
#[async_trait]
pub trait ScriptPersistence: Send + Sync {
    /// Load the last flushed snapshot (empty on first run)
    async fn load(&self) -> Result<Vec<ScriptRecord>, StoreError>;

    /// Replace the stored snapshot with `records`
    async fn persist(&self, records: &[ScriptRecord]) -> Result<(), StoreError>;
}

/// Volatile backend, used by tests and `storage = "memory"`
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<ScriptRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ScriptRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Last flushed snapshot
    pub fn records(&self) -> Vec<ScriptRecord> {
        self.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ScriptRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("memory snapshot lock poisoned: {}", e)))
    }
}

#[async_trait]
impl ScriptPersistence for MemoryPersistence {
    async fn load(&self) -> Result<Vec<ScriptRecord>, StoreError> {
        Ok(self.lock()?.clone())
    }

    async fn persist(&self, records: &[ScriptRecord]) -> Result<(), StoreError> {
        *self.lock()? = records.to_vec();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    scripts: Vec<ScriptRecord>,
}

/// JSON file backend. Writes go to a sibling temp file which is synced
/// and then renamed over the target, so a crash never leaves a torn snapshot.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "scripts.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ScriptPersistence for JsonFilePersistence {
    async fn load(&self) -> Result<Vec<ScriptRecord>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "Snapshot {} has version {}, expected {}",
                self.path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(snapshot.scripts)
    }

    async fn persist(&self, records: &[ScriptRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            scripts: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, &self.path).await?;
        debug!("Flushed {} script(s) to {}", records.len(), self.path.display());
        Ok(())
    }
}

/// Retry policy applied to every flush
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(50),
        }
    }
}

/// Flush `records`, retrying retryable failures up to `policy.retries` times
pub async fn persist_with_retry(
    backend: &dyn ScriptPersistence,
    records: &[ScriptRecord],
    policy: RetryPolicy,
) -> Result<(), CrudError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match backend.persist(records).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempts <= policy.retries => {
                warn!(attempt = attempts, "Persisting scripts failed, retrying: {}", e);
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                error!(attempts, "Giving up persisting scripts: {}", e);
                return Err(CrudError::Persistence {
                    attempts,
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample() -> ScriptRecord {
        let code = "// ==UserScript==\n// @name Sample\n// @match <all_urls>\n// ==/UserScript==\n";
        let manifest = Manifest::parse(code).unwrap();
        ScriptRecord::from_manifest("sample.js".to_string(), code.to_string(), manifest, true)
    }

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ScriptPersistence for Flaky {
        async fn load(&self) -> Result<Vec<ScriptRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn persist(&self, _records: &[ScriptRecord]) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("flaky".to_string()));
            }
            Ok(())
        }
    }

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let backend = MemoryPersistence::new();
        backend.persist(&[sample()]).await.unwrap();
        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "sample.js");
    }

    #[tokio::test]
    async fn test_json_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFilePersistence::new(dir.path().join("nested/scripts.json"));
        assert!(backend.load().await.unwrap().is_empty());

        let record = sample();
        backend.persist(std::slice::from_ref(&record)).await.unwrap();
        assert!(backend.path().exists());
        assert!(!backend.temp_path().exists());
        assert_eq!(backend.load().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_json_file_overwrite_replaces_whole_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFilePersistence::new(dir.path().join("scripts.json"));

        let first = sample();
        let mut second = sample();
        second.name = "second.js".to_string();
        backend
            .persist(&[first.clone(), second])
            .await
            .unwrap();
        backend.persist(std::slice::from_ref(&first)).await.unwrap();

        assert!(!backend.temp_path().exists());
        let raw = std::fs::read_to_string(backend.path()).unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot["version"], SNAPSHOT_VERSION);
        assert_eq!(backend.load().await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_json_file_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scripts.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFilePersistence::new(path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let backend = Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        persist_with_retry(&backend, &[sample()], fast_policy(3))
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let backend = Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let err = persist_with_retry(&backend, &[sample()], fast_policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CrudError::Persistence { attempts: 3, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }
}
