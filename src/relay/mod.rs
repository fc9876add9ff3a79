//! Relay server
//!
//! Composes the core: one listener accepts tunnel-establishment connections
//! and drives each through the Connecting → Active handshake; a second
//! listener accepts public HTTP requests and hands each to the router. The
//! two listeners share only the registry, never per-connection state.

use crate::config::RelayConfig;
use crate::protocol::{
    self, ClientHello, HandshakeReply, DRAIN_GRACE, HANDSHAKE_TIMEOUT,
};
use crate::registry::ClientRegistry;
use crate::{router, session};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The public-facing relay process
pub struct RelayServer {
    registry: Arc<ClientRegistry>,
    auth_tokens: Arc<HashSet<String>>,
    tls: Option<tokio_rustls::TlsAcceptor>,
    tunnel_listener: TcpListener,
    public_listener: TcpListener,
    conn_semaphore: Arc<Semaphore>,
}

impl RelayServer {
    /// Bind both listeners. The registry is injected so relays can share an
    /// external store.
    pub async fn bind(
        config: &RelayConfig,
        registry: Arc<ClientRegistry>,
    ) -> crate::Result<Self> {
        let tunnel_listener = TcpListener::bind(&config.tunnel_listen).await?;
        let public_listener = TcpListener::bind(&config.public_listen).await?;

        Ok(Self {
            registry,
            auth_tokens: Arc::new(config.auth_tokens.iter().cloned().collect()),
            tls: None,
            tunnel_listener,
            public_listener,
            conn_semaphore: Arc::new(Semaphore::new(config.max_clients)),
        })
    }

    /// Wrap both listeners in TLS
    pub fn with_tls(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Bound tunnel-listener address
    pub fn tunnel_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.tunnel_listener.local_addr()?)
    }

    /// Bound public-listener address
    pub fn public_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.public_listener.local_addr()?)
    }

    /// Accept connections on both listeners until the task is cancelled
    pub async fn run(self) -> crate::Result<()> {
        info!(
            tunnel = %self.tunnel_listener.local_addr()?,
            public = %self.public_listener.local_addr()?,
            "Relay listening"
        );

        loop {
            tokio::select! {
                accepted = self.tunnel_listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_tunnel(stream, peer),
                    Err(e) => error!(error = %e, "Tunnel accept error"),
                },
                accepted = self.public_listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_public(stream, peer),
                    Err(e) => error!(error = %e, "Public accept error"),
                },
            }
        }
    }

    fn spawn_tunnel(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "New tunnel connection");

        let Ok(permit) = Arc::clone(&self.conn_semaphore).try_acquire_owned() else {
            warn!(%peer, "Tunnel connection limit reached, dropping");
            return;
        };

        let registry = Arc::clone(&self.registry);
        let tokens = Arc::clone(&self.auth_tokens);
        let tls = self.tls.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_tunnel_connection(stream, tls, tokens, registry).await {
                debug!(%peer, error = %e, "Tunnel connection ended");
            }
        });
    }

    fn spawn_public(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "New public connection");
        stream.set_nodelay(true).ok();

        let registry = Arc::clone(&self.registry);
        let tls = self.tls.clone();
        tokio::spawn(async move {
            let served = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => router::serve_connection(tls_stream, registry).await,
                    Err(e) => {
                        debug!(%peer, error = %e, "Public TLS accept failed");
                        return;
                    }
                },
                None => router::serve_connection(stream, registry).await,
            };
            if let Err(e) = served {
                debug!(%peer, error = %e, "Public connection error");
            }
        });
    }
}

async fn handle_tunnel_connection(
    stream: TcpStream,
    tls: Option<tokio_rustls::TlsAcceptor>,
    tokens: Arc<HashSet<String>>,
    registry: Arc<ClientRegistry>,
) -> crate::Result<()> {
    // Small control frames dominate this connection
    stream.set_nodelay(true)?;

    match tls {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            let (reader, writer) = tokio::io::split(tls_stream);
            establish_tunnel(reader, writer, tokens, registry).await
        }
        None => {
            let (reader, writer) = stream.into_split();
            establish_tunnel(reader, writer, tokens, registry).await
        }
    }
}

/// Drive the Connecting → Active handshake, then hand the transport to a
/// session. Holds the caller's connection permit until the session closes.
async fn establish_tunnel<R, W>(
    mut reader: R,
    mut writer: W,
    tokens: Arc<HashSet<String>>,
    registry: Arc<ClientRegistry>,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let hello: ClientHello = timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut reader))
        .await
        .map_err(|_| crate::Error::Timeout)??;

    // Authentication is a fact consumed here; an empty token list means an
    // open relay. Rejection allocates nothing.
    if !tokens.is_empty() && !tokens.contains(&hello.token) {
        warn!("Rejected tunnel connection: bad token");
        let reject = HandshakeReply::Reject {
            reason: "authentication failed".to_string(),
        };
        let _ = timeout(
            HANDSHAKE_TIMEOUT,
            protocol::write_message(&mut writer, &reject),
        )
        .await;
        return Err(crate::Error::AuthenticationFailed);
    }

    // Identity: verified reconnects evict the stale session and keep their
    // ID; everything else gets a freshly generated one.
    let mut fresh = true;
    let (client_id, resume_key) = match (&hello.client_id, &hello.resume_key) {
        (Some(id), Some(key)) => match registry.verify_resume(id, key).await {
            Ok(()) => {
                if let Some(stale) = registry.take_session(id).await {
                    info!(client_id = %id, "Evicting stale session for reconnect");
                    stale.shutdown().await;
                    let _ = timeout(DRAIN_GRACE, stale.closed()).await;
                }
                fresh = false;
                (id.clone(), key.clone())
            }
            Err(_) => {
                warn!(client_id = %id, "Resume credential rejected, issuing fresh identity");
                registry.register_new().await?
            }
        },
        _ => registry.register_new().await?,
    };

    let welcome = HandshakeReply::Welcome {
        client_id: client_id.clone(),
        resume_key,
    };
    let sent = timeout(
        HANDSHAKE_TIMEOUT,
        protocol::write_message(&mut writer, &welcome),
    )
    .await;
    if !matches!(sent, Ok(Ok(()))) {
        if fresh {
            let _ = registry.remove_entry(&client_id).await;
        }
        return Err(crate::Error::ConnectionClosed);
    }

    let handle = session::spawn(client_id.clone(), reader, writer, Arc::clone(&registry));
    if let Err(e) = registry.insert_session(handle.clone()).await {
        handle.shutdown().await;
        return Err(e.into());
    }

    info!(client_id = %client_id, "Tunnel session active");
    handle.closed().await;
    Ok(())
}
