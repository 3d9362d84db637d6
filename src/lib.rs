//! Background service core of a userscript browser extension.
//!
//! The service owns the script store and its CRUD surface, authorizes every
//! inbound message against a static default-deny table, and tracks which
//! tabs carry the bridge and which one holds the live REPL transport.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub mod bridge;
pub mod builtins;
pub mod config;
pub mod connections;
pub mod error;
pub mod manifest;
pub mod persistence;
pub mod repository;
pub mod store;
pub mod transport;

pub use bridge::{BridgeMessage, Disposition, MessageBridge, MessageSource, MessageType};
pub use config::{Config, StorageBackend};
pub use connections::{ConnectionTracker, IconState, IconStateChange, TabId};
pub use error::{CrudError, ErrorCode, ErrorResponse};
pub use repository::ScriptRepository;

use config::ConfigError;
use persistence::{JsonFilePersistence, MemoryPersistence, ScriptPersistence};
use transport::{LiveTransport, LoopbackTransport};

/// Single owner of the store, the connection tracker and the bridge
pub struct BackgroundService {
    scripts: Arc<ScriptRepository>,
    connections: Arc<ConnectionTracker>,
    transport: Arc<dyn LiveTransport>,
    bridge: MessageBridge,
}

impl BackgroundService {
    /// Start with the configured storage backend and an in-process transport
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let backend = storage_backend(&config)?;
        Self::with_parts(config, backend, Arc::new(LoopbackTransport::new())).await
    }

    /// Start from explicit collaborators
    pub async fn with_parts(
        config: Config,
        backend: Arc<dyn ScriptPersistence>,
        transport: Arc<dyn LiveTransport>,
    ) -> anyhow::Result<Self> {
        let scripts = Arc::new(ScriptRepository::open(backend, config.retry_policy()).await?);
        let connections = Arc::new(ConnectionTracker::new(config.event_buffer));
        let bridge = MessageBridge::new(
            Arc::clone(&scripts),
            Arc::clone(&connections),
            Arc::clone(&transport),
        );

        info!(
            storage = ?config.storage,
            retries = config.persist_retries,
            "Background service started"
        );

        Ok(Self {
            scripts,
            connections,
            transport,
            bridge,
        })
    }

    /// Dispatch one inbound message. `None` for dropped and fire-and-forget
    /// messages alike.
    pub async fn handle(&self, message: BridgeMessage) -> Option<Value> {
        self.bridge.handle(message).await
    }

    pub fn scripts(&self) -> &Arc<ScriptRepository> {
        &self.scripts
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    /// The browser reported that `tab` committed a new navigation
    pub async fn tab_navigated(&self, tab: TabId) {
        self.release_transport(tab).await;
        self.connections.navigated(tab);
    }

    /// The browser reported that `tab` was closed
    pub async fn tab_closed(&self, tab: TabId) {
        self.release_transport(tab).await;
        self.connections.tab_closed(tab);
    }

    async fn release_transport(&self, tab: TabId) {
        if self.connections.active_tab() == Some(tab) {
            if let Err(e) = self.transport.close(tab).await {
                debug!(tab, "Closing transport of departing tab: {}", e);
            }
        }
    }
}

fn storage_backend(config: &Config) -> Result<Arc<dyn ScriptPersistence>, ConfigError> {
    match config.storage {
        StorageBackend::Memory => Ok(Arc::new(MemoryPersistence::new())),
        StorageBackend::File => {
            let path = config.storage_path.clone().ok_or_else(|| {
                ConfigError::Invalid("storage_path is required for the file backend".to_string())
            })?;
            Ok(Arc::new(JsonFilePersistence::new(path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_seeds_builtins() {
        let service = BackgroundService::start(Config::default()).await.unwrap();
        let reply = service
            .handle(BridgeMessage::new(
                MessageSource::PrivilegedUi,
                None,
                json!({ "type": "list-scripts" }),
            ))
            .await
            .unwrap();

        let names: Vec<&str> = reply["scripts"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|s| s["name"].as_str())
            .collect();
        assert!(names.contains(&"gist_installer.js"));
    }

    #[tokio::test]
    async fn test_navigation_releases_transport() {
        let service = BackgroundService::start(Config::default()).await.unwrap();
        let page = |body| BridgeMessage::new(MessageSource::PageScript, Some(4), body);

        assert!(service.handle(page(json!({ "type": "bridge-ready" }))).await.is_none());
        assert!(service.handle(page(json!({ "type": "ws-connect" }))).await.is_none());
        assert_eq!(service.connections().icon_state(4), IconState::Connected);

        service.tab_navigated(4).await;
        assert_eq!(service.connections().icon_state(4), IconState::Disconnected);
        assert_eq!(service.connections().active_tab(), None);
    }
}
