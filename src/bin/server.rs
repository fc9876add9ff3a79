//! Pulse Relay server
//!
//! The public-facing relay process:
//! - Accepts tunnel connections from private clients and assigns identities
//! - Accepts public HTTP requests and routes them into the tunnels
//! - Serves both listeners over TLS when a certificate is configured

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use pulse_relay::{
    config::{generate_example_config, Config},
    registry::{ClientRegistry, MemoryStore},
    relay::RelayServer,
};
use std::sync::Arc;
use tracing::info;

/// Pulse Relay - expose private HTTP servers through public URLs
#[derive(Parser, Debug)]
#[command(name = "pulse-relay")]
#[command(about = "Reverse-tunnel relay server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Tunnel listen address (overrides config)
    #[arg(short, long)]
    tunnel_listen: Option<String>,

    /// Public listen address (overrides config)
    #[arg(short, long)]
    public_listen: Option<String>,

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

    if args.init_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        info!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let mut relay_config = config
        .relay
        .ok_or_else(|| anyhow!("No [relay] section in config file"))?;

    if let Some(listen) = args.tunnel_listen {
        relay_config.tunnel_listen = listen;
    }
    if let Some(listen) = args.public_listen {
        relay_config.public_listen = listen;
    }

    if relay_config.auth_tokens.is_empty() {
        info!("No auth_tokens configured - relay accepts any client");
    } else {
        info!(
            "Loaded {} client auth token(s)",
            relay_config.auth_tokens.len()
        );
    }

    let registry = Arc::new(ClientRegistry::new(
        Arc::new(MemoryStore::new()),
        relay_config.locator(),
    ));

    let mut server = RelayServer::bind(&relay_config, registry)
        .await
        .context("Failed to bind listeners")?;

    if let (Some(cert_path), Some(key_path)) = (&relay_config.tls_cert, &relay_config.tls_key) {
        let certs = load_certs(cert_path).context("Failed to load TLS certificate")?;
        let key = load_private_key(key_path).context("Failed to load TLS private key")?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to build TLS server config")?;

        info!("TLS enabled with cert: {}", cert_path);
        server = server.with_tls(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config)));
    } else {
        info!("TLS disabled (no tls_cert/tls_key configured)");
    }

    info!("Pulse Relay v{}", pulse_relay::VERSION);

    tokio::select! {
        result = server.run() => result.context("Relay server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Load TLS certificate chain from PEM file
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).context(format!("Failed to open cert file: {}", path))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse PEM certificates")?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).context(format!("Failed to open key file: {}", path))?,
    );
    rustls_pemfile::private_key(&mut file)
        .context("Failed to parse PEM private key")?
        .ok_or_else(|| anyhow!("No private key found in {}", path))
}
