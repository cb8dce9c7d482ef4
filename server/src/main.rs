//! Server binary: parses arguments, loads configuration, wires the
//! transport, database workers and main loop together.

use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc;

use server::app::ServerApp;
use server::config::ServerConfig;
use server::database::{Database, MemoryDatabase};
use server::network;

#[derive(Parser)]
#[command(about = "Authoritative arena server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured tick rate
    #[arg(short, long)]
    tick_rate: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        ServerConfig::load(&args.config)?
    } else {
        warn!("config file {:?} not found; using defaults", args.config);
        ServerConfig::default()
    };

    if let Some(host) = args.host {
        config.network.host = host;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(tick_rate) = args.tick_rate {
        config.game.tick_rate = tick_rate;
    }

    let (callback_tx, callback_rx) = mpsc::unbounded_channel();

    let memory = MemoryDatabase::new();
    let database = Database::new(
        config.database.worker_count,
        memory.connection_factory(),
        callback_tx.clone(),
    );

    let (local_addr, event_rx) =
        network::start(&config.network.host, config.network.port).await?;

    info!("arena server ready on {}", local_addr);

    let app = ServerApp::new(config, database, callback_tx);
    app.run(event_rx, callback_rx).await;

    Ok(())
}
