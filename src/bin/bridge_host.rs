//! Stdio host for the background service.
//!
//! Reads one JSON object per line from stdin and writes one JSON object per
//! line to stdout. Logs go to stderr.
//!
//! Requests: `{"id": .., "source": "page-script", "tab_id": 3, "message": {"type": "ping"}}`
//! Tab lifecycle: `{"event": "tab-navigated" | "tab-closed", "tab_id": 3}`

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use userscript_bridge::{
    BackgroundService, BridgeMessage, Config, MessageSource, StorageBackend, TabId,
};

#[derive(Parser)]
#[command(name = "bridge-host")]
#[command(about = "Userscript bridge background service over stdio")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep scripts in this JSON file instead of the configured backend
    #[arg(long)]
    storage_file: Option<PathBuf>,

    /// Write icon-state changes to stdout as they happen
    #[arg(long)]
    icon_events: bool,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Deserialize)]
struct HostRequest {
    #[serde(default)]
    id: Option<Value>,
    source: MessageSource,
    #[serde(default)]
    tab_id: Option<TabId>,
    message: Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum TabEvent {
    TabNavigated,
    TabClosed,
}

#[derive(Debug, Deserialize)]
struct HostEvent {
    event: TabEvent,
    tab_id: TabId,
}

#[derive(Debug, Serialize)]
struct HostReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    reply: Value,
}

fn init_tracing(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("userscript_bridge={level},bridge_host={level}")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::from_env()?,
    };
    if let Some(path) = &cli.storage_file {
        config.storage = StorageBackend::File;
        config.storage_path = Some(path.clone());
    }
    Ok(config)
}

async fn handle_line(service: &BackgroundService, line: &str) -> anyhow::Result<Option<Value>> {
    let value: Value = serde_json::from_str(line).context("input is not JSON")?;

    if value.get("event").is_some() {
        let event: HostEvent = serde_json::from_value(value).context("malformed tab event")?;
        match event.event {
            TabEvent::TabNavigated => service.tab_navigated(event.tab_id).await,
            TabEvent::TabClosed => service.tab_closed(event.tab_id).await,
        }
        return Ok(None);
    }

    let request: HostRequest = serde_json::from_value(value).context("malformed request")?;
    let message = BridgeMessage::new(request.source, request.tab_id, request.message);
    let reply = service.handle(message).await;
    Ok(reply.map(|reply| {
        serde_json::to_value(HostReply {
            id: request.id,
            reply,
        })
        .unwrap_or(Value::Null)
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let config = load_config(&cli)?;
    let service = BackgroundService::start(config).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(value) = out_rx.recv().await {
            let mut line = value.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    if cli.icon_events {
        let mut events = service.connections().subscribe();
        let tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(change) => {
                        let line = json!({
                            "event": "icon-state",
                            "tab_id": change.tab_id,
                            "state": change.state,
                        });
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Icon-state listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match handle_line(&service, &line).await {
                    Ok(Some(reply)) => {
                        if out_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    // Malformed input gets no reply, same as a dropped message
                    Err(e) => debug!("Ignoring input line: {:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    drop(out_tx);
    drop(service);
    let _ = writer.await;
    info!("Bridge host stopped");
    Ok(())
}
