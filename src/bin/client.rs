//! Pulse Relay client
//!
//! The agent that runs next to a private HTTP server:
//! - Dials the relay and is assigned a public URL path
//! - Serves multiplexed requests by proxying them to the local server
//! - Reconnects under its issued identity when the tunnel drops

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use pulse_relay::{client::TunnelClient, config::Config};
use tracing::info;

/// Pulse Relay client - expose a local HTTP server through the relay
#[derive(Parser, Debug)]
#[command(name = "pulse-client")]
#[command(about = "Reverse-tunnel client agent")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Relay tunnel address (overrides config)
    #[arg(short, long)]
    relay: Option<String>,

    /// Local server address to expose (overrides config)
    #[arg(short, long)]
    local: Option<String>,

    /// Auth token (overrides config)
    #[arg(short, long)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let config = Config::load(&args.config).unwrap_or_default();
    let mut client_config = config.client.unwrap_or_default();

    if let Some(relay) = args.relay {
        client_config.relay_addr = relay;
    }
    if let Some(local) = args.local {
        client_config.local_addr = local;
    }
    if let Some(token) = args.token {
        client_config.token = token;
    }

    info!("Pulse Relay client v{}", pulse_relay::VERSION);
    info!(
        "Exposing {} through relay {}",
        client_config.local_addr, client_config.relay_addr
    );

    let mut client = TunnelClient::new(
        client_config.relay_addr,
        client_config.token,
        client_config.local_addr,
    );

    match (&client_config.tls_ca, &client_config.tls_server_name) {
        (Some(ca), Some(name)) => {
            client = client
                .with_tls(ca, name)
                .context("Failed to configure TLS")?;
            info!("TLS enabled for relay dial");
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(anyhow!(
                "TLS requires both tls_ca and tls_server_name in [client] config"
            ));
        }
        (None, None) => {}
    }

    tokio::select! {
        result = client.run() => result.context("Tunnel client failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
