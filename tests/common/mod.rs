#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use userscript_bridge::error::StoreError;
use userscript_bridge::persistence::{MemoryPersistence, RetryPolicy, ScriptPersistence};
use userscript_bridge::store::ScriptRecord;
use userscript_bridge::transport::LoopbackTransport;
use userscript_bridge::{
    BackgroundService, BridgeMessage, Config, MessageSource, ScriptRepository, TabId,
};

pub const GIST_INSTALLER: &str = "gist_installer.js";
pub const BRIDGE_DIAGNOSTICS: &str = "bridge_diagnostics.js";

/// Minimal valid userscript named `name` matching example.com
pub fn script(name: &str) -> String {
    script_matching(name, &["https://example.com/*"])
}

pub fn script_matching(name: &str, patterns: &[&str]) -> String {
    let mut code = String::from("// ==UserScript==\n");
    code.push_str(&format!("// @name        {}\n", name));
    for pattern in patterns {
        code.push_str(&format!("// @match       {}\n", pattern));
    }
    code.push_str("// ==/UserScript==\n");
    code.push_str(&format!("console.log({:?});\n", name));
    code
}

/// Fast retries so failure tests do not sleep
pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        retries: 2,
        delay: std::time::Duration::from_millis(1),
    }
}

pub async fn open_repo() -> ScriptRepository {
    ScriptRepository::open(Arc::new(MemoryPersistence::new()), quick_retry())
        .await
        .expect("repository should open")
}

/// Test service wired to in-memory storage and a loopback transport
pub struct TestService {
    pub service: BackgroundService,
    pub transport: Arc<LoopbackTransport>,
}

impl TestService {
    pub async fn start() -> Self {
        let transport = Arc::new(LoopbackTransport::new());
        let service = BackgroundService::with_parts(
            Config::default(),
            Arc::new(MemoryPersistence::new()),
            transport.clone(),
        )
        .await
        .expect("service should start");
        Self { service, transport }
    }

    pub async fn ui(&self, message: Value) -> Option<Value> {
        self.send(MessageSource::PrivilegedUi, None, message).await
    }

    pub async fn page(&self, tab: TabId, message: Value) -> Option<Value> {
        self.send(MessageSource::PageScript, Some(tab), message).await
    }

    pub async fn userscript(&self, tab: TabId, message: Value) -> Option<Value> {
        self.send(MessageSource::Userscript, Some(tab), message).await
    }

    pub async fn send(
        &self,
        source: MessageSource,
        tab: Option<TabId>,
        message: Value,
    ) -> Option<Value> {
        self.service
            .handle(BridgeMessage::new(source, tab, message))
            .await
    }

    /// Names of every stored record, hidden ones included
    pub async fn all_names(&self) -> Vec<String> {
        self.service
            .scripts()
            .ls(&userscript_bridge::repository::ListOptions {
                include_hidden: true,
            })
            .await
            .into_iter()
            .map(|m| m.name)
            .collect()
    }
}

/// Backend whose writes fail while `failing` is set
#[derive(Default)]
pub struct SwitchablePersistence {
    inner: MemoryPersistence,
    pub failing: AtomicBool,
}

impl SwitchablePersistence {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<ScriptRecord> {
        self.inner.records()
    }
}

#[async_trait]
impl ScriptPersistence for SwitchablePersistence {
    async fn load(&self) -> Result<Vec<ScriptRecord>, StoreError> {
        self.inner.load().await
    }

    async fn persist(&self, records: &[ScriptRecord]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("storage offline".to_string()));
        }
        self.inner.persist(records).await
    }
}
