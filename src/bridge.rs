//! Secure message bridge between the extension UI, page script and
//! userscripts.
//!
//! Every inbound message is classified by `(source, type)` alone:
//!
//! - **responded**: the operation runs and its result is replied
//! - **no-response**: the operation runs, nothing is replied
//! - **dropped**: nothing runs, nothing is replied
//!
//! No-response and dropped look the same from the outside, so a caller
//! cannot probe which types exist for which source. The table in
//! [`authorize`] is exhaustive over [`MessageType`]; a new type does not
//! compile until each source has been given a disposition.

use crate::builtins::resolve_libraries;
use crate::connections::{ConnectionTracker, HandshakeOutcome, TabId};
use crate::error::{CrudError, ErrorCode, ErrorResponse, ErrorResponseBuilder};
use crate::repository::{ListOptions, MoveOptions, RemoveOptions, SaveOptions, ScriptRepository};
use crate::transport::{LiveTransport, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default port of the live REPL relay
pub const DEFAULT_TRANSPORT_PORT: u16 = 1340;

/// Trust domain a message arrived from. Assigned by the receiving side,
/// never read from the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageSource {
    PrivilegedUi,
    PageScript,
    Userscript,
}

impl MessageSource {
    pub const ALL: [MessageSource; 3] = [
        MessageSource::PrivilegedUi,
        MessageSource::PageScript,
        MessageSource::Userscript,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    ListScripts,
    GetScript,
    SaveScript,
    RenameScript,
    DeleteScript,
    ToggleScript,
    GetIconState,
    GetConnections,
    ConnectTab,
    DisconnectTab,
    LoadManifest,
    BridgeReady,
    WsConnect,
    WsSend,
    WsClose,
}

impl MessageType {
    pub const ALL: [MessageType; 16] = [
        MessageType::Ping,
        MessageType::ListScripts,
        MessageType::GetScript,
        MessageType::SaveScript,
        MessageType::RenameScript,
        MessageType::DeleteScript,
        MessageType::ToggleScript,
        MessageType::GetIconState,
        MessageType::GetConnections,
        MessageType::ConnectTab,
        MessageType::DisconnectTab,
        MessageType::LoadManifest,
        MessageType::BridgeReady,
        MessageType::WsConnect,
        MessageType::WsSend,
        MessageType::WsClose,
    ];

    pub fn from_wire(name: &str) -> Option<Self> {
        let ty = match name {
            "ping" => MessageType::Ping,
            "list-scripts" => MessageType::ListScripts,
            "get-script" => MessageType::GetScript,
            "save-script" => MessageType::SaveScript,
            "rename-script" => MessageType::RenameScript,
            "delete-script" => MessageType::DeleteScript,
            "toggle-script" => MessageType::ToggleScript,
            "get-icon-state" => MessageType::GetIconState,
            "get-connections" => MessageType::GetConnections,
            "connect-tab" => MessageType::ConnectTab,
            "disconnect-tab" => MessageType::DisconnectTab,
            "load-manifest" => MessageType::LoadManifest,
            "bridge-ready" => MessageType::BridgeReady,
            "ws-connect" => MessageType::WsConnect,
            "ws-send" => MessageType::WsSend,
            "ws-close" => MessageType::WsClose,
            _ => return None,
        };
        Some(ty)
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::ListScripts => "list-scripts",
            MessageType::GetScript => "get-script",
            MessageType::SaveScript => "save-script",
            MessageType::RenameScript => "rename-script",
            MessageType::DeleteScript => "delete-script",
            MessageType::ToggleScript => "toggle-script",
            MessageType::GetIconState => "get-icon-state",
            MessageType::GetConnections => "get-connections",
            MessageType::ConnectTab => "connect-tab",
            MessageType::DisconnectTab => "disconnect-tab",
            MessageType::LoadManifest => "load-manifest",
            MessageType::BridgeReady => "bridge-ready",
            MessageType::WsConnect => "ws-connect",
            MessageType::WsSend => "ws-send",
            MessageType::WsClose => "ws-close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Responded,
    NoResponse,
    Dropped,
}

/// The authorization table.
pub fn authorize(source: MessageSource, message_type: MessageType) -> Disposition {
    use Disposition::{Dropped, NoResponse, Responded};

    // (privileged-ui, page-script, userscript)
    let (ui, page, userscript) = match message_type {
        MessageType::Ping => (Responded, Responded, Responded),
        MessageType::ListScripts => (Responded, Responded, Responded),
        MessageType::GetScript => (Responded, Responded, Responded),
        MessageType::SaveScript => (Responded, Responded, Dropped),
        MessageType::RenameScript => (Responded, Responded, Dropped),
        MessageType::DeleteScript => (Responded, Responded, Dropped),
        MessageType::ToggleScript => (Responded, Dropped, Dropped),
        MessageType::GetIconState => (Responded, Dropped, Dropped),
        MessageType::GetConnections => (Responded, Dropped, Dropped),
        MessageType::ConnectTab => (Responded, Dropped, Dropped),
        MessageType::DisconnectTab => (Responded, Dropped, Dropped),
        MessageType::LoadManifest => (Dropped, Responded, Dropped),
        MessageType::BridgeReady => (Dropped, NoResponse, Dropped),
        MessageType::WsConnect => (Dropped, NoResponse, Dropped),
        MessageType::WsSend => (Dropped, NoResponse, Dropped),
        MessageType::WsClose => (Dropped, NoResponse, Dropped),
    };

    match source {
        MessageSource::PrivilegedUi => ui,
        MessageSource::PageScript => page,
        MessageSource::Userscript => userscript,
    }
}

/// Disposition of a raw wire type. Unknown types are dropped for everyone.
pub fn disposition(source: MessageSource, message_type: &str) -> Disposition {
    MessageType::from_wire(message_type)
        .map(|ty| authorize(source, ty))
        .unwrap_or(Disposition::Dropped)
}

/// An inbound message: a trusted envelope around an untrusted body of the
/// form `{"type": "...", ...payload}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub source: MessageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    pub message: Value,
}

impl BridgeMessage {
    pub fn new(source: MessageSource, tab_id: Option<TabId>, message: Value) -> Self {
        Self {
            source,
            tab_id,
            message,
        }
    }

    pub fn message_type(&self) -> &str {
        self.message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// A single item or a list, for the calls that accept both
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Debug, Deserialize)]
struct ListScriptsRequest {
    #[serde(default)]
    options: ListOptions,
}

#[derive(Debug, Deserialize)]
struct GetScriptRequest {
    name: OneOrMany<String>,
}

#[derive(Debug, Deserialize)]
struct SaveScriptRequest {
    code: OneOrMany<String>,
    #[serde(default)]
    options: SaveOptions,
}

#[derive(Debug, Deserialize)]
struct RenameScriptRequest {
    from: String,
    to: String,
    #[serde(default)]
    options: MoveOptions,
}

#[derive(Debug, Deserialize)]
struct DeleteScriptRequest {
    name: OneOrMany<String>,
    #[serde(default)]
    options: RemoveOptions,
}

#[derive(Debug, Deserialize)]
struct ToggleScriptRequest {
    name: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct TabRequest {
    tab_id: TabId,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct LoadManifestRequest {
    #[serde(default)]
    libraries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WsConnectRequest {
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct WsSendRequest {
    data: Value,
}

fn decode<T: DeserializeOwned>(message: &Value) -> Result<T, CrudError> {
    serde_json::from_value(message.clone()).map_err(|e| CrudError::validation("payload", e.to_string()))
}

fn transport_error(err: TransportError) -> ErrorResponse {
    ErrorResponseBuilder::new(ErrorCode::TransportError, err.to_string()).build()
}

fn reply<T: Serialize>(value: T) -> Result<Value, ErrorResponse> {
    serde_json::to_value(value).map_err(|e| {
        ErrorResponseBuilder::new(ErrorCode::ValidationError, "Failed to encode reply")
            .details(e.to_string())
            .build()
    })
}

pub struct MessageBridge {
    scripts: Arc<ScriptRepository>,
    connections: Arc<ConnectionTracker>,
    transport: Arc<dyn LiveTransport>,
}

impl MessageBridge {
    pub fn new(
        scripts: Arc<ScriptRepository>,
        connections: Arc<ConnectionTracker>,
        transport: Arc<dyn LiveTransport>,
    ) -> Self {
        Self {
            scripts,
            connections,
            transport,
        }
    }

    /// Handle one message. `Some` only for responded messages.
    pub async fn handle(&self, message: BridgeMessage) -> Option<Value> {
        let source = message.source;
        let Some(message_type) = MessageType::from_wire(message.message_type()) else {
            debug!(source = ?source, "Dropping message of unknown type");
            return None;
        };

        match authorize(source, message_type) {
            Disposition::Dropped => {
                debug!(
                    source = ?source,
                    message_type = message_type.as_wire(),
                    "Dropping unauthorized message"
                );
                None
            }
            Disposition::NoResponse => {
                self.notify(message_type, &message).await;
                None
            }
            Disposition::Responded => {
                let reply = match self.respond(message_type, &message).await {
                    Ok(value) => value,
                    Err(err) => {
                        debug!(
                            source = ?source,
                            message_type = message_type.as_wire(),
                            code = err.code.as_str(),
                            "Request failed: {}",
                            err.error
                        );
                        serde_json::to_value(err).unwrap_or(Value::Null)
                    }
                };
                Some(reply)
            }
        }
    }

    async fn respond(
        &self,
        message_type: MessageType,
        message: &BridgeMessage,
    ) -> Result<Value, ErrorResponse> {
        let body = &message.message;
        match message_type {
            MessageType::Ping => Ok(json!({ "success": true, "pong": true })),
            MessageType::ListScripts => {
                let req: ListScriptsRequest = decode(body)?;
                let scripts = self.scripts.ls(&req.options).await;
                Ok(json!({ "success": true, "scripts": scripts }))
            }
            MessageType::GetScript => {
                let req: GetScriptRequest = decode(body)?;
                match req.name {
                    OneOrMany::One(name) => {
                        let code = self.scripts.cat(&name).await;
                        Ok(json!({ "success": true, "name": name, "code": code }))
                    }
                    OneOrMany::Many(names) => {
                        let scripts = self.scripts.cat_many(&names).await;
                        Ok(json!({ "success": true, "scripts": scripts }))
                    }
                }
            }
            MessageType::SaveScript => {
                let req: SaveScriptRequest = decode(body)?;
                match req.code {
                    OneOrMany::One(code) => reply(self.scripts.save(&code, &req.options).await?),
                    OneOrMany::Many(codes) => {
                        let results = self.scripts.save_many(&codes, &req.options).await?;
                        Ok(json!({ "success": true, "results": results }))
                    }
                }
            }
            MessageType::RenameScript => {
                let req: RenameScriptRequest = decode(body)?;
                reply(self.scripts.mv(&req.from, &req.to, &req.options).await?)
            }
            MessageType::DeleteScript => {
                let req: DeleteScriptRequest = decode(body)?;
                match req.name {
                    OneOrMany::One(name) => reply(self.scripts.rm(&name, &req.options).await?),
                    OneOrMany::Many(names) => {
                        let results = self.scripts.rm_many(&names, &req.options).await?;
                        Ok(json!({ "success": true, "results": results }))
                    }
                }
            }
            MessageType::ToggleScript => {
                let req: ToggleScriptRequest = decode(body)?;
                let script = self.scripts.set_enabled(&req.name, req.enabled).await?;
                Ok(json!({ "success": true, "script": script }))
            }
            MessageType::GetIconState => {
                let req: TabRequest = decode(body)?;
                let state = self.connections.icon_state(req.tab_id);
                Ok(json!({ "success": true, "tab_id": req.tab_id, "state": state }))
            }
            MessageType::GetConnections => Ok(json!({
                "success": true,
                "connections": self.connections.connections(),
            })),
            MessageType::ConnectTab => {
                let req: TabRequest = decode(body)?;
                let port = req.port.unwrap_or(DEFAULT_TRANSPORT_PORT);
                self.open_transport(req.tab_id, port)
                    .await
                    .map_err(transport_error)?;
                let state = self.connections.icon_state(req.tab_id);
                Ok(json!({ "success": true, "tab_id": req.tab_id, "state": state }))
            }
            MessageType::DisconnectTab => {
                let req: TabRequest = decode(body)?;
                self.close_transport(req.tab_id).await;
                let state = self.connections.icon_state(req.tab_id);
                Ok(json!({ "success": true, "tab_id": req.tab_id, "state": state }))
            }
            MessageType::LoadManifest => {
                let req: LoadManifestRequest = decode(body)?;
                let plan = resolve_libraries(req.libraries.as_slice());
                Ok(json!({ "success": true, "files": plan.files, "unknown": plan.unknown }))
            }
            MessageType::BridgeReady
            | MessageType::WsConnect
            | MessageType::WsSend
            | MessageType::WsClose => Err(CrudError::validation(
                "type",
                format!("'{}' does not take a reply", message_type.as_wire()),
            )
            .into()),
        }
    }

    /// Fire-and-forget handling. Failures are logged, never reported.
    async fn notify(&self, message_type: MessageType, message: &BridgeMessage) {
        let Some(tab) = message.tab_id else {
            debug!(
                message_type = message_type.as_wire(),
                "Ignoring tab message without a tab id"
            );
            return;
        };
        let body = &message.message;

        match message_type {
            MessageType::BridgeReady => self.connections.mark_injected(tab),
            MessageType::WsConnect => {
                let port = decode::<WsConnectRequest>(body)
                    .ok()
                    .and_then(|r| r.port)
                    .unwrap_or(DEFAULT_TRANSPORT_PORT);
                if let Err(e) = self.open_transport(tab, port).await {
                    warn!(tab, port, "Transport handshake failed: {}", e);
                }
            }
            MessageType::WsSend => {
                if self.connections.active_tab() != Some(tab) {
                    debug!(tab, "Ignoring send from a tab that does not hold the transport");
                    return;
                }
                match decode::<WsSendRequest>(body) {
                    Ok(req) => {
                        if let Err(e) = self.transport.send(tab, req.data).await {
                            warn!(tab, "Transport send failed: {}", e);
                        }
                    }
                    Err(e) => debug!(tab, "Ignoring malformed send: {}", e),
                }
            }
            MessageType::WsClose => self.close_transport(tab).await,
            other => debug!(
                message_type = other.as_wire(),
                "No fire-and-forget handler for message type"
            ),
        }
    }

    async fn open_transport(&self, tab: TabId, port: u16) -> Result<(), TransportError> {
        let ticket = self.connections.begin_handshake(tab);
        if let Err(e) = self.transport.open(tab, port).await {
            self.connections.abandon_handshake(tab, ticket);
            return Err(e);
        }

        match self.connections.complete_handshake(tab, ticket) {
            HandshakeOutcome::Attached => info!(tab, port, "Live transport attached"),
            HandshakeOutcome::Superseded => {
                debug!(tab, port, "Handshake superseded by a newer one for the same tab")
            }
            HandshakeOutcome::Cancelled => {
                // The tab left while the handshake was running
                if let Err(e) = self.transport.close(tab).await {
                    debug!(tab, "Closing orphaned transport: {}", e);
                }
                info!(tab, port, "Discarded transport of a departed tab");
            }
        }
        Ok(())
    }

    /// Close the transport if `tab` holds it. Other tabs keep their state.
    async fn close_transport(&self, tab: TabId) {
        if self.connections.active_tab() != Some(tab) {
            debug!(tab, "Tab does not hold the transport, nothing to close");
            return;
        }
        if let Err(e) = self.transport.close(tab).await {
            debug!(tab, "Closing transport: {}", e);
        }
        self.connections.transport_closed(tab);
        info!(tab, "Live transport closed");
    }
}
