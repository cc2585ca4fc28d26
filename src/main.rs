//! portgate
//!
//! One executable serving both tunnel roles: a JSON config file with a
//! `server` block, a `client` block, or both decides what this process
//! does. Runs until interrupted.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use portgate::{supervisor, Config};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Reverse TCP port-forwarding tunnel
#[derive(Parser, Debug)]
#[command(name = "portgate")]
#[command(about = "Reverse TCP port-forwarding tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, default_value = "config.json")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let log_level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    if config.server.is_none() && config.client.is_none() {
        return Err(anyhow!("config has neither a server nor a client block"));
    }

    info!("portgate v{}", portgate::VERSION);

    let shutdown = CancellationToken::new();
    let supervisor = tokio::spawn(supervisor::run(config, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    shutdown.cancel();
    let _ = supervisor.await;

    Ok(())
}
