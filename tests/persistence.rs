mod common;

use common::{GIST_INSTALLER, quick_retry, script};
use std::sync::Arc;
use userscript_bridge::ScriptRepository;
use userscript_bridge::persistence::{JsonFilePersistence, ScriptPersistence};
use userscript_bridge::repository::{ListOptions, SaveOptions};

async fn open(path: &std::path::Path) -> ScriptRepository {
    ScriptRepository::open(Arc::new(JsonFilePersistence::new(path)), quick_retry())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_scripts_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("scripts.json");

    {
        let repo = open(&path).await;
        repo.save(&script("Persisted"), &SaveOptions::default())
            .await
            .unwrap();
        repo.set_enabled(GIST_INSTALLER, false).await.unwrap();
    }

    let repo = open(&path).await;
    assert!(repo.cat("persisted.js").await.is_some());
    // Built-in re-sync keeps the user's flag
    let gist = repo.get(GIST_INSTALLER).await.unwrap();
    assert!(gist.builtin);
    assert!(!gist.enabled);
}

#[tokio::test]
async fn test_tampered_builtin_is_restored_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scripts.json");
    let backend = JsonFilePersistence::new(&path);

    {
        let repo = open(&path).await;
        repo.save(&script("Mine"), &SaveOptions::default())
            .await
            .unwrap();
    }

    let mut records = backend.load().await.unwrap();
    for record in records.iter_mut().filter(|r| r.name == GIST_INSTALLER) {
        record.code = "// tampered".to_string();
    }
    backend.persist(&records).await.unwrap();

    let repo = open(&path).await;
    let restored = repo.cat(GIST_INSTALLER).await.unwrap();
    assert!(restored.contains("==UserScript=="));
    assert!(repo.cat("mine.js").await.is_some());

    let listed = repo
        .ls(&ListOptions {
            include_hidden: true,
        })
        .await;
    assert_eq!(
        listed.iter().filter(|m| m.name == GIST_INSTALLER).count(),
        1
    );
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scripts.json");
    tokio::fs::write(&path, b"{ not json").await.unwrap();

    let result =
        ScriptRepository::open(Arc::new(JsonFilePersistence::new(&path)), quick_retry()).await;
    assert!(result.is_err());
}
