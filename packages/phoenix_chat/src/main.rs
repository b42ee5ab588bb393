use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use phoenix_channels::{Socket, SocketDriver, SocketHandle, WebSocketTransport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod chat;
mod config;

use config::{ChatConfig, load_config};

#[derive(Parser)]
#[command(name = "phx-chat", about = "Join a Phoenix channel and watch it")]
struct Cli {
    /// Socket endpoint, e.g. ws://localhost:4000/socket
    #[arg(long)]
    url: Option<String>,

    /// Topic to join
    #[arg(long)]
    topic: Option<String>,

    /// Config file (TOML)
    #[arg(long, default_value = "phoenix.toml")]
    config: PathBuf,

    /// Event pushed after each successful join
    #[arg(long, default_value = "ping")]
    event: String,

    /// JSON payload for the pushed event
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose {
        "phoenix_channels=debug,phx_chat=debug,info"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut config: ChatConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(topic) = cli.topic {
        config.topic = topic;
    }
    let payload: serde_json::Value =
        serde_json::from_str(&cli.payload).context("--payload is not valid JSON")?;

    run(config, cli.event, payload).await
}

async fn run(config: ChatConfig, event: String, payload: serde_json::Value) -> Result<()> {
    let (transport, events) = WebSocketTransport::new();
    let mut socket = Socket::new(&config.url, config.socket.clone(), transport);
    info!(endpoint = %socket.endpoint_url(), topic = %config.topic, "starting");

    let join_params = serde_json::to_value(&config.join_params)?;
    let id = socket.channel(&config.topic, join_params);
    chat::log_traffic(&mut socket, &config.topic);
    chat::track_presence(&mut socket, id)?;
    chat::join_and_push(&mut socket, id, event, payload)?;
    socket.connect();

    let (driver, handle) = SocketDriver::new(socket, events);
    let cancel = CancellationToken::new();
    tokio::spawn(leave_on_ctrl_c(handle, id, cancel.clone()));

    driver.run_until(cancel).await;
    info!("bye");
    Ok(())
}

async fn leave_on_ctrl_c(handle: SocketHandle, id: phoenix_channels::ChannelId, cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    info!("leaving");
    let done = cancel.clone();
    if handle
        .run(move |socket| chat::leave_and_stop(socket, id, done))
        .is_err()
    {
        cancel.cancel();
    }
}
