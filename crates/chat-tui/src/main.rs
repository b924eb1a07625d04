use std::path::PathBuf;

use anyhow::Result;
use chat_core::{event_channel, ChatController, NodeConfig, RemotePeer};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;

use app::ChatApp;

#[derive(Parser)]
#[command(name = "chat-tui")]
#[command(about = "A terminal UI for P2P chat")]
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

    /// How long a keep-alive probe waits for an answer
    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log: String,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        config.listen_port = self.listen_port;
        config.username = self.username;
        if let (Some(host), Some(port)) = (self.remote_host, self.remote_port) {
            config.remote = Some(RemotePeer { host, port });
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe_timeout_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they stay out of the chat transcript
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = args.into_config()?;
    tracing::info!("Starting chat TUI on port {}", config.listen_port);

    let (events_tx, events_rx) = event_channel();
    let controller = ChatController::start(config, events_tx).await?;

    let (app, commands) = ChatApp::new(controller.username().to_string());
    app.print_help();

    let printer = tokio::spawn(app::print_events(events_rx));
    let runner = tokio::spawn(controller.clone().run_commands(commands));

    app.handle_user_input().await?;
    drop(app);
    runner.await?;
    controller.shutdown().await;
    printer.abort();

    println!("\rGoodbye!");
    Ok(())
}
