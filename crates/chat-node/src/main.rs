use std::path::PathBuf;

use anyhow::Result;
use chat_core::{event_channel, ChatController, ChatEvent, EventReceiver, NodeConfig, RemotePeer};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chat-node")]
#[command(about = "A headless P2P chat node")]
struct Args {
    /// Port to listen on (1025-65535)
    listen_port: u16,

    /// Name announced to other peers
    username: String,

    /// Host of a peer to join at startup
    #[arg(requires = "remote_port")]
    remote_host: Option<String>,

    /// Listen port of that peer
    remote_port: Option<u16>,

    /// JSON settings file; command-line values win
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    config.listen_port = args.listen_port;
    config.username = args.username;
    if let (Some(host), Some(port)) = (args.remote_host, args.remote_port) {
        config.remote = Some(RemotePeer { host, port });
    }
    if let Some(ms) = args.probe_timeout_ms {
        config.probe_timeout_ms = ms;
    }
    config.validate()?;

    info!("Starting chat node on port {}", config.listen_port);

    let (events_tx, events_rx) = event_channel();
    let controller = ChatController::start(config, events_tx).await?;
    let logger = tokio::spawn(log_events(events_rx));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, disconnecting from {} peers", controller.registry().len());
    controller.shutdown().await;
    logger.abort();

    Ok(())
}

async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::ChatMessageArrived { peer, timestamp, text } => {
                info!(from = %peer.display_name(), timestamp, "{text}");
            }
            ChatEvent::ClientConnected(peer) => info!("Peer connected: {peer}"),
            ChatEvent::ClientDisconnected { peer, reason } => {
                info!("Peer disconnected: {peer} ({reason})")
            }
            ChatEvent::SendFailed { peer, reason, .. } => match peer {
                Some(peer) => warn!("Send to {peer} failed: {reason}"),
                None => warn!("Send failed: {reason}"),
            },
            ChatEvent::DuplicateResolved { kept, dropped } => {
                info!("Duplicate connection: kept {kept}, dropped {dropped}")
            }
            ChatEvent::ConnectFailed { address, reason } => {
                warn!("Could not connect to {address}: {reason}")
            }
        }
    }
}
