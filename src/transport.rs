//! Boundary to the live REPL transport.
//!
//! The wire protocol is owned by an external collaborator; the service only
//! opens, feeds and closes it on behalf of a tab. Payloads are opaque JSON.

use crate::connections::TabId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport handshake failed: {0}")]
    Handshake(String),
    #[error("No open transport for tab {0}")]
    NotOpen(TabId),
    #[error("Transport send failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Open a transport for `tab` on `port`. Resolves once the handshake
    /// succeeded.
    async fn open(&self, tab: TabId, port: u16) -> Result<(), TransportError>;

    async fn send(&self, tab: TabId, frame: serde_json::Value) -> Result<(), TransportError>;

    async fn close(&self, tab: TabId) -> Result<(), TransportError>;
}

/// In-process transport that accepts every handshake and keeps sent frames
/// per tab. Used when no external relay is configured and in tests.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    open: Mutex<HashMap<TabId, Vec<serde_json::Value>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames sent on `tab`'s transport since it was opened
    pub fn sent_frames(&self, tab: TabId) -> Vec<serde_json::Value> {
        self.open
            .lock()
            .map(|g| g.get(&tab).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn is_open(&self, tab: TabId) -> bool {
        self.open
            .lock()
            .map(|g| g.contains_key(&tab))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LiveTransport for LoopbackTransport {
    async fn open(&self, tab: TabId, port: u16) -> Result<(), TransportError> {
        let mut open = self
            .open
            .lock()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        // A single transport is live at a time
        open.clear();
        open.insert(tab, Vec::new());
        debug!(tab, port, "Loopback transport opened");
        Ok(())
    }

    async fn send(&self, tab: TabId, frame: serde_json::Value) -> Result<(), TransportError> {
        let mut open = self
            .open
            .lock()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        open.get_mut(&tab)
            .ok_or(TransportError::NotOpen(tab))?
            .push(frame);
        Ok(())
    }

    async fn close(&self, tab: TabId) -> Result<(), TransportError> {
        let mut open = self
            .open
            .lock()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        open.remove(&tab).ok_or(TransportError::NotOpen(tab))?;
        debug!(tab, "Loopback transport closed");
        Ok(())
    }
}
