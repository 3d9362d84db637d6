mod common;

use common::{GIST_INSTALLER, TestService, script};
use serde_json::{Value, json};
use userscript_bridge::bridge::{authorize, disposition};
use userscript_bridge::{Disposition, IconState, MessageSource, MessageType};

/// A well-formed body for every message type
fn sample_body(ty: MessageType) -> Value {
    let mut body = match ty {
        MessageType::Ping
        | MessageType::ListScripts
        | MessageType::GetConnections
        | MessageType::BridgeReady
        | MessageType::WsConnect
        | MessageType::WsClose => json!({}),
        MessageType::GetScript => json!({ "name": GIST_INSTALLER }),
        MessageType::SaveScript => json!({ "code": script("Probe") }),
        MessageType::RenameScript => json!({ "from": "probe", "to": "other" }),
        MessageType::DeleteScript => json!({ "name": "probe" }),
        MessageType::ToggleScript => json!({ "name": GIST_INSTALLER, "enabled": false }),
        MessageType::GetIconState | MessageType::DisconnectTab => json!({ "tab_id": 1 }),
        MessageType::ConnectTab => json!({ "tab_id": 1, "port": 1340 }),
        MessageType::LoadManifest => json!({ "libraries": ["scittle://reagent.js"] }),
        MessageType::WsSend => json!({ "data": { "op": "eval" } }),
    };
    body["type"] = json!(ty.as_wire());
    body
}

async fn observable_state(svc: &TestService) -> (Vec<String>, Value, Vec<Value>) {
    let names = svc.all_names().await;
    let flags = json!(
        svc.service
            .scripts()
            .get(GIST_INSTALLER)
            .await
            .map(|r| r.enabled)
    );
    let connections = svc
        .service
        .connections()
        .connections()
        .into_iter()
        .map(|c| json!(c))
        .collect();
    (names, flags, connections)
}

// ============================================================================
// Authorization table
// ============================================================================

#[tokio::test]
async fn test_every_source_and_type_pair_behaves_per_table() {
    for source in MessageSource::ALL {
        for ty in MessageType::ALL {
            let svc = TestService::start().await;
            let before = observable_state(&svc).await;

            let reply = svc.send(source, Some(1), sample_body(ty)).await;
            let expected = authorize(source, ty);

            assert_eq!(
                reply.is_some(),
                expected == Disposition::Responded,
                "{:?} / {} replied {:?}",
                source,
                ty.as_wire(),
                reply
            );
            if expected == Disposition::Dropped {
                assert_eq!(
                    observable_state(&svc).await,
                    before,
                    "dropped {:?} / {} changed state",
                    source,
                    ty.as_wire()
                );
                assert!(svc.transport.sent_frames(1).is_empty());
            }
        }
    }
}

#[tokio::test]
async fn test_unknown_type_from_page_is_silent_and_inert() {
    let svc = TestService::start().await;
    let before = observable_state(&svc).await;

    let payloads = [
        json!({ "type": "eval-in-background", "code": "alert(1)" }),
        json!({ "type": "save-script!", "code": script("Sneaky") }),
        json!({ "type": "SAVE-SCRIPT", "code": script("Sneaky") }),
        json!({ "type": 42 }),
        json!({ "code": script("Untyped") }),
        json!("just a string"),
        Value::Null,
    ];
    for payload in payloads {
        assert!(svc.page(1, payload).await.is_none());
    }

    assert_eq!(observable_state(&svc).await, before);
    assert!(svc.service.scripts().cat("sneaky").await.is_none());
}

#[tokio::test]
async fn test_dropped_and_no_response_look_identical() {
    let svc = TestService::start().await;

    let dropped = svc.userscript(2, json!({ "type": "save-script", "code": script("x") })).await;
    let silent = svc.page(2, json!({ "type": "bridge-ready" })).await;
    assert_eq!(dropped, silent);
    assert!(dropped.is_none());

    // The silent one still did its work
    assert_eq!(svc.service.connections().icon_state(2), IconState::Injected);
    assert!(svc.service.scripts().cat("x").await.is_none());
}

#[test]
fn test_load_manifest_is_page_only() {
    assert_eq!(
        disposition(MessageSource::PageScript, "load-manifest"),
        Disposition::Responded
    );
    assert_eq!(
        disposition(MessageSource::PrivilegedUi, "load-manifest"),
        Disposition::Dropped
    );
    assert_eq!(
        disposition(MessageSource::Userscript, "load-manifest"),
        Disposition::Dropped
    );
}

// ============================================================================
// Replies
// ============================================================================

#[tokio::test]
async fn test_page_can_manage_scripts() {
    let svc = TestService::start().await;

    let saved = svc
        .page(1, json!({ "type": "save-script", "code": script("From Page") }))
        .await
        .unwrap();
    assert_eq!(saved["success"], json!(true));
    assert_eq!(saved["name"], json!("from_page.js"));

    let fetched = svc
        .userscript(1, json!({ "type": "get-script", "name": "from_page.js" }))
        .await
        .unwrap();
    assert!(fetched["code"].as_str().unwrap().contains("==UserScript=="));

    let listed = svc
        .userscript(1, json!({ "type": "list-scripts" }))
        .await
        .unwrap();
    assert!(
        listed["scripts"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["name"] == json!("from_page.js") && s["match"].is_array())
    );

    let renamed = svc
        .page(1, json!({ "type": "rename-script", "from": "from_page.js", "to": "renamed" }))
        .await
        .unwrap();
    assert_eq!(renamed["to"], json!("renamed.js"));

    let deleted = svc
        .page(1, json!({ "type": "delete-script", "name": "renamed.js" }))
        .await
        .unwrap();
    assert_eq!(deleted["existed"], json!(true));
}

#[tokio::test]
async fn test_error_replies_carry_codes() {
    let svc = TestService::start().await;

    let reply = svc
        .ui(json!({ "type": "delete-script", "name": GIST_INSTALLER, "options": { "force": true } }))
        .await
        .unwrap();
    assert_eq!(reply["success"], json!(false));
    assert_eq!(reply["code"], json!("BUILTIN_PROTECTED"));
    assert!(reply["error"].as_str().unwrap().contains("built-in"));

    let reply = svc
        .ui(json!({ "type": "delete-script", "name": ["a", "b"] }))
        .await
        .unwrap();
    assert_eq!(reply["code"], json!("BATCH_REJECTED"));
    assert_eq!(reply["context"]["failures"].as_array().unwrap().len(), 2);

    let reply = svc
        .ui(json!({ "type": "rename-script", "from": "only-one-field" }))
        .await
        .unwrap();
    assert_eq!(reply["code"], json!("VALIDATION_ERROR"));
}

#[tokio::test]
async fn test_batch_replies_keep_input_keys() {
    let svc = TestService::start().await;

    let reply = svc
        .ui(json!({ "type": "save-script", "code": [script("One"), script("Two")] }))
        .await
        .unwrap();
    assert_eq!(reply["results"]["0"]["success"], json!(true));
    assert_eq!(reply["results"]["1"]["name"], json!("two.js"));

    let reply = svc
        .ui(json!({ "type": "get-script", "name": ["two", "missing"] }))
        .await
        .unwrap();
    assert!(reply["scripts"]["two"].is_string());
    assert!(reply["scripts"]["missing"].is_null());
}

#[tokio::test]
async fn test_load_manifest_resolves_dependencies() {
    let svc = TestService::start().await;

    let reply = svc
        .page(
            3,
            json!({ "type": "load-manifest", "libraries": ["scittle://re-frame.js", "scittle://nope.js"] }),
        )
        .await
        .unwrap();

    let files: Vec<&str> = reply["files"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(
        files,
        vec![
            "vendor/react.production.min.js",
            "vendor/react-dom.production.min.js",
            "vendor/scittle.reagent.js",
            "vendor/scittle.re-frame.js",
        ]
    );
    assert_eq!(reply["unknown"], json!(["scittle://nope.js"]));
}

// ============================================================================
// Live transport messages
// ============================================================================

#[tokio::test]
async fn test_ws_send_only_from_transport_holder() {
    let svc = TestService::start().await;

    assert!(svc.page(1, json!({ "type": "ws-connect" })).await.is_none());
    assert!(svc.page(1, json!({ "type": "ws-send", "data": "a" })).await.is_none());
    assert!(svc.page(2, json!({ "type": "ws-send", "data": "b" })).await.is_none());

    assert_eq!(svc.transport.sent_frames(1), vec![json!("a")]);
    assert!(svc.transport.sent_frames(2).is_empty());

    assert!(svc.page(1, json!({ "type": "ws-close" })).await.is_none());
    assert_eq!(svc.service.connections().icon_state(1), IconState::Disconnected);
    assert!(!svc.transport.is_open(1));
}

#[tokio::test]
async fn test_fire_and_forget_without_tab_is_ignored() {
    let svc = TestService::start().await;

    let reply = svc
        .send(MessageSource::PageScript, None, json!({ "type": "bridge-ready" }))
        .await;
    assert!(reply.is_none());
    assert!(svc.service.connections().connections().is_empty());
}

#[tokio::test]
async fn test_ui_connect_and_disconnect_tab() {
    let svc = TestService::start().await;

    let reply = svc
        .ui(json!({ "type": "connect-tab", "tab_id": 9 }))
        .await
        .unwrap();
    assert_eq!(reply["state"], json!("connected"));
    assert!(svc.transport.is_open(9));

    let reply = svc
        .ui(json!({ "type": "get-connections" }))
        .await
        .unwrap();
    assert_eq!(reply["connections"], json!([{ "tab_id": 9, "state": "connected" }]));

    let reply = svc
        .ui(json!({ "type": "disconnect-tab", "tab_id": 9 }))
        .await
        .unwrap();
    assert_eq!(reply["state"], json!("disconnected"));
}
