//! relay-proxy binary: runs a pass-through dispatcher from a TOML file.

use std::path::PathBuf;

use clap::Parser;

use relay_proxy::config::{load_config, Configuration};
use relay_proxy::lifecycle::signals::stop_on_signal;
use relay_proxy::observability::{logging, metrics};
use relay_proxy::Dispatcher;

#[derive(Debug, Parser)]
#[command(name = "relay-proxy", version, about = "HTTP/1.1, HTTP/2 and WebSocket reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "relay-proxy.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init(&config.observability.log_level, config.observability.log_json);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "relay-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        hostname = %config.listener.hostname,
        port = config.listener.port,
        mode = ?config.listener.mode,
        upstreams = config.upstreams.len(),
        proxy_request_ms = config.timeouts.proxy_request_ms,
        "Configuration loaded"
    );

    let dispatcher = Dispatcher::new(Configuration::from_proxy_config(&config)?)?;
    let addr = dispatcher.start().await?;
    tracing::info!(address = %addr, "Listening for connections");

    stop_on_signal(&dispatcher).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
