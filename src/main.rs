//! soup-server binary: a standalone listener set driven by a TOML file.
//!
//! With `tunnel.enabled` it works as a CONNECT forward proxy; without it
//! every request is answered 404, which is mostly useful for smoke tests.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use soup_server::config::{load_config, ServerConfig};
use soup_server::lifecycle::{signals::shutdown_signal, start};
use soup_server::observability::{logging, metrics};

/// How long open connections get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "soup-server", version, about = "Embeddable HTTP server engine")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "soup-server starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = start(&config).await?;
    if server.listeners().is_empty() {
        tracing::warn!("No listeners configured");
    }

    shutdown_signal().await;
    server.shutdown().await;
    server.drain(DRAIN_TIMEOUT).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
