//! # Pulse Relay
//!
//! A reverse-tunnel relay that exposes privately-hosted HTTP servers to the
//! public internet without inbound firewall access.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Relay Server                       │
//! │   (public HTTP listener + tunnel listener, composed   │
//! │    over a shared client registry)                     │
//! ├──────────────────────────────────────────────────────┤
//! │                   Request Router                      │
//! │   (path → session resolution, response correlation)   │
//! ├──────────────────────────────────────────────────────┤
//! │                   Tunnel Session                      │
//! │   (lifecycle, identity, heartbeats, drain/close)      │
//! ├──────────────────────────────────────────────────────┤
//! │                 Stream Multiplexer                    │
//! │   (framing, per-stream windows, demultiplexing)       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! A private client dials the relay's tunnel listener, authenticates, and is
//! assigned a client ID. Public requests to `/<client-id>/<path>` are
//! multiplexed as individual streams over the client's one persistent
//! connection; the client answers each stream by proxying it to its
//! configured local server.

pub mod client;
pub mod config;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tunnel-establishment port
pub const DEFAULT_TUNNEL_PORT: u16 = 4443;

/// Default public HTTP port
pub const DEFAULT_PUBLIC_PORT: u16 = 8080;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("HTTP error: {0}")]
    Http(#[from] http::HttpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
