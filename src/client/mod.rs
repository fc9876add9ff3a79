//! Tunnel client
//!
//! The agent that runs next to a private HTTP server. Dials the relay,
//! completes the handshake, then answers multiplexed streams by proxying
//! each one to the configured local address. Reconnects under its issued
//! identity with exponential backoff when the transport is lost.

use crate::http::{self, BodyReader, RequestHead};
use crate::protocol::{
    self, ClientHello, HandshakeReply, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL,
    LIVENESS_TIMEOUT, LOCAL_CONNECT_TIMEOUT, PROTOCOL_VERSION,
};
use crate::tunnel::{
    chunk_cost, Frame, FrameType, SendBudget, CHUNK_CHANNEL_CAPACITY, DEFAULT_WINDOW_SIZE,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Messages routed from the tunnel to one stream's request pump
enum StreamIn {
    Headers(RequestHead),
    Chunk(Bytes),
    End,
}

/// Flow-control signals routed to one stream's response sender
enum StreamCredit {
    Grant(u32),
    Cancelled,
}

struct StreamRoute {
    in_tx: mpsc::Sender<StreamIn>,
    credit_tx: mpsc::UnboundedSender<StreamCredit>,
}

/// A tunnel client for one private server
pub struct TunnelClient {
    relay_addr: String,
    token: String,
    local_addr: String,
    tls: Option<(tokio_rustls::TlsConnector, rustls::pki_types::ServerName<'static>)>,
    identity: Option<(String, String)>,
}

impl TunnelClient {
    pub fn new(relay_addr: impl Into<String>, token: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            token: token.into(),
            local_addr: local_addr.into(),
            tls: None,
            identity: None,
        }
    }

    /// Enable TLS on the relay dial, trusting the given CA bundle
    pub fn with_tls(mut self, ca_path: &str, server_name: &str) -> crate::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let mut file = std::io::BufReader::new(std::fs::File::open(ca_path)?);
        for cert in rustls_pemfile::certs(&mut file) {
            roots
                .add(cert?)
                .map_err(|e| crate::Error::Config(format!("bad CA certificate: {}", e)))?;
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|_| crate::Error::Config(format!("bad server name: {}", server_name)))?;
        self.tls = Some((tokio_rustls::TlsConnector::from(Arc::new(config)), name));
        Ok(self)
    }

    /// The (client ID, resume key) pair issued by the relay, once connected
    pub fn identity(&self) -> Option<&(String, String)> {
        self.identity.as_ref()
    }

    /// Dial the relay and complete the handshake. Presents the stored
    /// identity when reconnecting so the public URL stays stable.
    pub async fn connect(&mut self) -> crate::Result<ConnectedTunnel> {
        let tcp = TcpStream::connect(&self.relay_addr).await?;
        tcp.set_nodelay(true)?;

        let (mut reader, mut writer): (BoxedReader, BoxedWriter) = match &self.tls {
            Some((connector, name)) => {
                let tls_stream = connector.connect(name.clone(), tcp).await?;
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = tcp.into_split();
                (Box::new(r), Box::new(w))
            }
        };

        let hello = ClientHello {
            version: PROTOCOL_VERSION,
            token: self.token.clone(),
            client_id: self.identity.as_ref().map(|(id, _)| id.clone()),
            resume_key: self.identity.as_ref().map(|(_, key)| key.clone()),
        };
        timeout(HANDSHAKE_TIMEOUT, protocol::write_message(&mut writer, &hello))
            .await
            .map_err(|_| crate::Error::Timeout)??;

        let reply: HandshakeReply =
            timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut reader))
                .await
                .map_err(|_| crate::Error::Timeout)??;

        match reply {
            HandshakeReply::Welcome {
                client_id,
                resume_key,
            } => {
                self.identity = Some((client_id.clone(), resume_key));
                Ok(ConnectedTunnel {
                    client_id,
                    reader,
                    writer,
                    local_addr: self.local_addr.clone(),
                })
            }
            HandshakeReply::Reject { reason } => {
                warn!(%reason, "Relay rejected tunnel");
                Err(crate::Error::AuthenticationFailed)
            }
        }
    }

    /// Run forever: connect, serve, reconnect with exponential backoff
    pub async fn run(mut self) -> crate::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.connect().await {
                Ok(tunnel) => {
                    info!(client_id = %tunnel.client_id(), "Tunnel established");
                    backoff = Duration::from_secs(1);
                    if let Err(e) = tunnel.serve().await {
                        warn!(error = %e, "Tunnel lost");
                    }
                }
                Err(crate::Error::AuthenticationFailed) => {
                    return Err(crate::Error::AuthenticationFailed);
                }
                Err(e) => {
                    warn!(error = %e, "Relay connection failed");
                }
            }
            debug!(delay = ?backoff, "Reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }
}

/// An established tunnel, ready to serve streams
pub struct ConnectedTunnel {
    client_id: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    local_addr: String,
}

enum ReaderMessage {
    Frame(Frame),
    Closed,
}

impl ConnectedTunnel {
    /// The client ID assigned by the relay; the public URL path prefix
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Serve multiplexed streams until the transport is lost
    pub async fn serve(self) -> crate::Result<()> {
        let ConnectedTunnel {
            client_id,
            reader,
            mut writer,
            local_addr,
        } = self;

        // Single outbound writer; the channel serializes stream tasks
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if frame.write_to(&mut writer).await.is_err() {
                    break;
                }
            }
        });

        let (reader_msg_tx, mut reader_msg_rx) = mpsc::channel::<ReaderMessage>(256);
        let reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match Frame::read_from(&mut reader).await {
                    Ok(frame) => {
                        if reader_msg_tx.send(ReaderMessage::Frame(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = reader_msg_tx.send(ReaderMessage::Closed).await;
                        break;
                    }
                }
            }
        });

        let mut routes: HashMap<u32, StreamRoute> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u32>();
        let mut last_activity = Instant::now();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat_seq: u64 = 0;

        let result = loop {
            tokio::select! {
                Some(msg) = reader_msg_rx.recv() => match msg {
                    ReaderMessage::Frame(frame) => {
                        last_activity = Instant::now();
                        handle_frame(
                            frame,
                            &mut routes,
                            &local_addr,
                            &frame_tx,
                            &done_tx,
                        )
                        .await;
                    }
                    ReaderMessage::Closed => {
                        break Err(crate::Error::ConnectionClosed);
                    }
                },
                Some(stream_id) = done_rx.recv() => {
                    routes.remove(&stream_id);
                }
                _ = heartbeat.tick() => {
                    if last_activity.elapsed() > LIVENESS_TIMEOUT {
                        warn!(client_id = %client_id, "Relay liveness timeout");
                        break Err(crate::Error::Timeout);
                    }
                    heartbeat_seq += 1;
                    if frame_tx.send(Frame::heartbeat(heartbeat_seq)).await.is_err() {
                        break Err(crate::Error::ConnectionClosed);
                    }
                }
            }
        };

        // Cut every in-flight stream loose so nothing hangs on a dead tunnel
        for (_, route) in routes.drain() {
            let _ = route.credit_tx.send(StreamCredit::Cancelled);
        }
        reader_task.abort();
        writer_task.abort();
        result
    }
}

/// Route one inbound frame to its stream, creating the stream on OpenRequest
async fn handle_frame(
    frame: Frame,
    routes: &mut HashMap<u32, StreamRoute>,
    local_addr: &str,
    frame_tx: &mpsc::Sender<Frame>,
    done_tx: &mpsc::UnboundedSender<u32>,
) {
    let stream_id = frame.stream_id;
    match frame.frame_type {
        FrameType::OpenRequest => {
            if routes.contains_key(&stream_id) {
                // At most one outstanding stream may hold an ID
                warn!(stream_id, "Stream ID collision");
                let _ = frame_tx
                    .send(Frame::stream_error(stream_id, "stream id collision"))
                    .await;
                return;
            }
            let (in_tx, in_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            let (credit_tx, credit_rx) = mpsc::unbounded_channel();
            routes.insert(stream_id, StreamRoute { in_tx, credit_tx });

            let local_addr = local_addr.to_string();
            let frames = frame_tx.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                serve_stream(stream_id, local_addr, in_rx, credit_rx, frames).await;
                let _ = done.send(stream_id);
            });
        }
        FrameType::RequestHeaders => match frame.decode_request_head() {
            Ok(head) => deliver(routes, frame_tx, stream_id, StreamIn::Headers(head)).await,
            Err(e) => {
                debug!(stream_id, error = %e, "Malformed request headers");
                fail_route(routes, frame_tx, stream_id, "malformed request headers").await;
            }
        },
        FrameType::RequestBodyChunk => {
            deliver(routes, frame_tx, stream_id, StreamIn::Chunk(frame.payload)).await;
        }
        FrameType::RequestEnd => {
            deliver(routes, frame_tx, stream_id, StreamIn::End).await;
        }
        FrameType::WindowUpdate => {
            if let Ok(increment) = frame.decode_window_update() {
                if let Some(route) = routes.get(&stream_id) {
                    let _ = route.credit_tx.send(StreamCredit::Grant(increment));
                }
            }
        }
        FrameType::StreamError => {
            debug!(stream_id, reason = %frame.error_reason(), "Relay aborted stream");
            if let Some(route) = routes.remove(&stream_id) {
                let _ = route.credit_tx.send(StreamCredit::Cancelled);
            }
        }
        FrameType::Heartbeat => {}
        // Response-direction frames never flow toward the client
        _ => {
            debug!(stream_id, frame_type = ?frame.frame_type, "Unexpected frame");
        }
    }
}

async fn deliver(
    routes: &mut HashMap<u32, StreamRoute>,
    frame_tx: &mpsc::Sender<Frame>,
    stream_id: u32,
    msg: StreamIn,
) {
    let Some(route) = routes.get(&stream_id) else {
        // Stale frame for a stream that already finished locally
        return;
    };
    match route.in_tx.try_send(msg) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Sender overran the window it was granted
            fail_route(routes, frame_tx, stream_id, "flow control violation").await;
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            // Stream task already gone; let cleanup catch up
        }
    }
}

async fn fail_route(
    routes: &mut HashMap<u32, StreamRoute>,
    frame_tx: &mpsc::Sender<Frame>,
    stream_id: u32,
    reason: &str,
) {
    if let Some(route) = routes.remove(&stream_id) {
        let _ = route.credit_tx.send(StreamCredit::Cancelled);
    }
    let _ = frame_tx.send(Frame::stream_error(stream_id, reason)).await;
}

/// Serve one stream: proxy the request to the local server and answer with
/// the response, windowed chunk by chunk.
async fn serve_stream(
    stream_id: u32,
    local_addr: String,
    mut in_rx: mpsc::Receiver<StreamIn>,
    mut credit_rx: mpsc::UnboundedReceiver<StreamCredit>,
    frames: mpsc::Sender<Frame>,
) {
    let head = match in_rx.recv().await {
        Some(StreamIn::Headers(head)) => head,
        _ => {
            let _ = frames
                .send(Frame::stream_error(stream_id, "missing request headers"))
                .await;
            return;
        }
    };

    let local = match timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(&local_addr)).await {
        Ok(Ok(stream)) => stream,
        _ => {
            warn!(stream_id, %local_addr, "Local server unreachable");
            let _ = frames
                .send(Frame::stream_error(stream_id, "local server unreachable"))
                .await;
            return;
        }
    };
    local.set_nodelay(true).ok();
    let (local_read, mut local_write) = local.into_split();

    debug!(stream_id, method = %head.method, path = %head.path, "Serving stream");

    let method = head.method.clone();
    let chunked_request = http::is_chunked(&head.headers);

    if local_write
        .write_all(&http::encode_request_head(&head))
        .await
        .is_err()
    {
        let _ = frames
            .send(Frame::stream_error(stream_id, "local write failed"))
            .await;
        return;
    }

    // Pump the request body concurrently so an early response cannot
    // deadlock against a long upload. Consuming a chunk grants window
    // credit back to the relay.
    let pump_frames = frames.clone();
    let pump = tokio::spawn(async move {
        let mut pending_credit: u32 = 0;
        while let Some(msg) = in_rx.recv().await {
            match msg {
                StreamIn::Chunk(data) => {
                    let cost = chunk_cost(data.len());
                    let written = if chunked_request {
                        http::write_chunk(&mut local_write, &data).await.is_ok()
                    } else {
                        local_write.write_all(&data).await.is_ok()
                    };
                    if !written {
                        break;
                    }
                    pending_credit = pending_credit.saturating_add(cost);
                    if pending_credit >= DEFAULT_WINDOW_SIZE / 2 {
                        if pump_frames
                            .send(Frame::window_update(stream_id, pending_credit))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        pending_credit = 0;
                    }
                }
                StreamIn::End => {
                    if chunked_request {
                        let _ = http::finish_chunked(&mut local_write).await;
                    }
                    break;
                }
                StreamIn::Headers(_) => break,
            }
        }
        let _ = local_write.flush().await;
        // Keep the write half open until the response completes; some
        // servers treat an early FIN as a full connection close.
        local_write
    });

    // Read and relay the response
    let mut reader = BufReader::new(local_read);
    let mut response = match http::read_response_head(&mut reader).await {
        Ok(response) => response,
        Err(e) => {
            debug!(stream_id, error = %e, "Bad response from local server");
            let _ = frames
                .send(Frame::stream_error(stream_id, "bad local response"))
                .await;
            pump.abort();
            return;
        }
    };

    let body_kind =
        match http::response_body_kind(&method, response.status, &response.headers) {
            Ok(kind) => kind,
            Err(e) => {
                debug!(stream_id, error = %e, "Bad response framing");
                let _ = frames
                    .send(Frame::stream_error(stream_id, "bad local response"))
                    .await;
                pump.abort();
                return;
            }
        };
    http::strip_hop_by_hop(&mut response.headers);

    let headers_frame = match Frame::response_headers(stream_id, &response) {
        Ok(frame) => frame,
        Err(_) => {
            pump.abort();
            return;
        }
    };
    if frames.send(headers_frame).await.is_err() {
        pump.abort();
        return;
    }

    let mut budget = SendBudget::new();
    let mut body = BodyReader::new(&mut reader, body_kind);
    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                let cost = chunk_cost(chunk.len());
                let mut cancelled = false;
                while !budget.charge(cost) {
                    match credit_rx.recv().await {
                        Some(StreamCredit::Grant(increment)) => budget.credit(increment),
                        Some(StreamCredit::Cancelled) | None => {
                            cancelled = true;
                            break;
                        }
                    }
                }
                if cancelled {
                    break;
                }
                if frames
                    .send(Frame::response_chunk(stream_id, chunk))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                let _ = frames.send(Frame::response_end(stream_id)).await;
                break;
            }
            Err(e) => {
                debug!(stream_id, error = %e, "Local response body failed");
                let _ = frames
                    .send(Frame::stream_error(stream_id, "local response truncated"))
                    .await;
                break;
            }
        }
    }

    let _ = pump.await;
}
