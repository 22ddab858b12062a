mod server;
mod storage;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use sessionlink_core::{logging, Config};

use server::SessionLinkServer;

#[derive(Parser, Debug)]
#[command(name = "sessionlink")]
#[command(about = "SessionLink video call signaling server", long_about = None)]
struct Args {
    /// Config file (TOML, YAML or JSON); environment variables override it
    #[arg(short, long, env = "SESSIONLINK_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("SessionLink server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Call storage
    let store = storage::init_call_store(&config).await?;

    // 4. Serve until shutdown
    SessionLinkServer::new(config, store).start().await
}
