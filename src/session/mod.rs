//! Tunnel session lifecycle
//!
//! One session owns one private client's persistent connection. The
//! transport is split three ways: a reader task that owns the read half, a
//! writer task that exclusively owns the write half (the mpsc in front of it
//! serializes concurrent stream writers, so partial frames can never
//! interleave on the wire), and a main task that owns the multiplexer state
//! and drives the `Connecting → Active → Draining → Closed` state machine.
//!
//! Routers talk to a session through a cloneable [`SessionHandle`]; each
//! opened exchange is surfaced as a [`ProxyStream`].

use crate::http::{RequestHead, ResponseHead};
use crate::protocol::{DRAIN_GRACE, HEARTBEAT_INTERVAL, LIVENESS_TIMEOUT};
use crate::registry::{ClientId, ClientRegistry};
use crate::tunnel::{chunk_cost, Frame, Multiplexer, SendBudget, StreamReceivers, TunnelError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress, no ID assigned
    Connecting,
    /// ID assigned and registered; streams may be opened
    Active,
    /// No new streams; in-flight streams are being failed explicitly
    Draining,
    /// Terminal; resources released, registry entry removed
    Closed,
}

/// Monotonic session incarnation counter. Lets the registry tell a stale
/// session's late cleanup apart from the replacement that took its ID.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

enum SessionCommand {
    OpenStream {
        head: RequestHead,
        reply: oneshot::Sender<Result<ProxyStream, TunnelError>>,
    },
    Consumed {
        stream_id: u32,
        len: usize,
    },
    Cancel {
        stream_id: u32,
        reason: String,
    },
    Shutdown,
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: ClientId,
    serial: u64,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// The client ID this session serves
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session incarnation
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// True while streams may still be opened
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connecting | SessionState::Active
        )
    }

    /// Open a multiplexed exchange on this session
    pub async fn open_stream(&self, head: RequestHead) -> Result<ProxyStream, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::OpenStream {
                head,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TunnelError::NotActive)?;
        reply_rx.await.map_err(|_| TunnelError::NotActive)?
    }

    /// Request shutdown. Idempotent: signalling a draining or closed
    /// session has no additional effect.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }

    /// Wait until the session reaches Closed
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        // A dropped sender means the session task is gone, which is as
        // closed as it gets.
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// One in-flight exchange, as seen by the router
pub struct ProxyStream {
    stream_id: u32,
    frame_tx: mpsc::Sender<Frame>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    head_rx: Option<oneshot::Receiver<Result<ResponseHead, TunnelError>>>,
    body_rx: mpsc::Receiver<Result<Bytes, TunnelError>>,
    credit_rx: mpsc::UnboundedReceiver<u32>,
    budget: SendBudget,
    finished: bool,
}

impl ProxyStream {
    fn new(
        stream_id: u32,
        frame_tx: mpsc::Sender<Frame>,
        cmd_tx: mpsc::Sender<SessionCommand>,
        receivers: StreamReceivers,
    ) -> Self {
        Self {
            stream_id,
            frame_tx,
            cmd_tx,
            head_rx: Some(receivers.head_rx),
            body_rx: receivers.body_rx,
            credit_rx: receivers.credit_rx,
            budget: SendBudget::new(),
            finished: false,
        }
    }

    /// Stream ID of this exchange
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Forward one request body chunk, waiting for window credit when the
    /// remote end is absorbing slowly.
    pub async fn send_body_chunk(&mut self, data: Bytes) -> Result<(), TunnelError> {
        let cost = chunk_cost(data.len());
        while !self.budget.charge(cost) {
            match self.credit_rx.recv().await {
                Some(increment) => self.budget.credit(increment),
                None => return Err(TunnelError::TransportLost),
            }
        }
        self.frame_tx
            .send(Frame::request_chunk(self.stream_id, data))
            .await
            .map_err(|_| TunnelError::TransportLost)
    }

    /// Mark the request as fully sent
    pub async fn finish_request(&mut self) -> Result<(), TunnelError> {
        self.frame_tx
            .send(Frame::request_end(self.stream_id))
            .await
            .map_err(|_| TunnelError::TransportLost)
    }

    /// Await the response head under a bounded timeout. A timeout aborts
    /// the exchange and releases the stream ID.
    pub async fn response_head(&mut self, timeout: Duration) -> Result<ResponseHead, TunnelError> {
        let rx = self.head_rx.take().ok_or(TunnelError::StreamClosed)?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.abort("response header timeout").await;
                Err(TunnelError::Timeout)
            }
            Ok(Err(_)) => {
                self.finished = true;
                Err(TunnelError::TransportLost)
            }
            Ok(Ok(result)) => {
                if result.is_err() {
                    self.finished = true;
                }
                result
            }
        }
    }

    /// Next response body chunk; None once the response is complete
    pub async fn next_body_chunk(&mut self) -> Option<Result<Bytes, TunnelError>> {
        match self.body_rx.recv().await {
            None => {
                self.finished = true;
                None
            }
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            Some(Ok(chunk)) => Some(Ok(chunk)),
        }
    }

    /// Report bytes absorbed by the public caller so the session can grant
    /// window credit back to the sender.
    pub async fn consumed(&self, len: usize) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::Consumed {
                stream_id: self.stream_id,
                len,
            })
            .await;
    }

    /// Abort the exchange, releasing the stream ID promptly
    pub async fn abort(&mut self, reason: &str) {
        if !self.finished {
            self.finished = true;
            let _ = self
                .cmd_tx
                .send(SessionCommand::Cancel {
                    stream_id: self.stream_id,
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

impl Drop for ProxyStream {
    fn drop(&mut self) {
        // A stream dropped mid-exchange means the public caller went away;
        // tell the session so the ID is not leaked for the session's life.
        if !self.finished {
            let _ = self.cmd_tx.try_send(SessionCommand::Cancel {
                stream_id: self.stream_id,
                reason: "caller disconnected".to_string(),
            });
        }
    }
}

enum ReaderMessage {
    Frame(Frame),
    Error(TunnelError),
    Closed,
}

/// Spawn a session over an established, authenticated transport. The
/// returned handle is what the registry stores; the session unregisters
/// itself when it closes.
pub fn spawn<R, W>(
    id: ClientId,
    reader: R,
    writer: W,
    registry: Arc<ClientRegistry>,
) -> SessionHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (frame_tx, frame_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

    let handle = SessionHandle {
        id: id.clone(),
        serial,
        cmd_tx: cmd_tx.clone(),
        state_rx,
    };

    tokio::spawn(run_session(
        id, serial, reader, writer, registry, cmd_tx, cmd_rx, frame_tx, frame_rx, state_tx,
    ));

    handle
}

#[allow(clippy::too_many_arguments)]
async fn run_session<R, W>(
    id: ClientId,
    serial: u64,
    reader: R,
    mut writer: W,
    registry: Arc<ClientRegistry>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    frame_tx: mpsc::Sender<Frame>,
    mut frame_rx: mpsc::Receiver<Frame>,
    state_tx: watch::Sender<SessionState>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let _ = state_tx.send(SessionState::Active);

    // Writer task: the single owner of the outbound transport. Flushes
    // whatever is queued before honoring shutdown.
    let (writer_shutdown_tx, writer_shutdown_rx) = oneshot::channel::<()>();
    let writer_task = tokio::spawn(async move {
        let mut shutdown = writer_shutdown_rx;
        loop {
            tokio::select! {
                biased;
                maybe = frame_rx.recv() => match maybe {
                    Some(frame) => {
                        if frame.write_to(&mut writer).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
    });

    // Reader task: owns the read half; never cancelled by the select loop
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
                Err(TunnelError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    let _ = reader_msg_tx.send(ReaderMessage::Closed).await;
                    break;
                }
                Err(e) => {
                    let _ = reader_msg_tx.send(ReaderMessage::Error(e)).await;
                    break;
                }
            }
        }
    });

    let mut mux = Multiplexer::new();
    let mut last_activity = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut heartbeat_seq: u64 = 0;

    let reason: String = 'session: loop {
        tokio::select! {
            Some(msg) = reader_msg_rx.recv() => match msg {
                ReaderMessage::Frame(frame) => {
                    last_activity = Instant::now();
                    match mux.handle_frame(frame) {
                        Ok(replies) => {
                            for f in replies {
                                if frame_tx.send(f).await.is_err() {
                                    break 'session "transport lost".to_string();
                                }
                            }
                        }
                        Err(e) => {
                            warn!(client_id = %id, error = %e, "Protocol violation");
                            break 'session format!("protocol error: {}", e);
                        }
                    }
                }
                ReaderMessage::Error(e) => {
                    break 'session format!("transport error: {}", e);
                }
                ReaderMessage::Closed => {
                    break 'session "connection closed by client".to_string();
                }
            },
            Some(cmd) = cmd_rx.recv() => match cmd {
                SessionCommand::OpenStream { head, reply } => {
                    match mux.open_stream(&head) {
                        Ok((stream_id, receivers, frames)) => {
                            let stream = ProxyStream::new(
                                stream_id,
                                frame_tx.clone(),
                                cmd_tx.clone(),
                                receivers,
                            );
                            let mut sent = true;
                            for f in frames {
                                if frame_tx.send(f).await.is_err() {
                                    sent = false;
                                    break;
                                }
                            }
                            if sent {
                                let _ = reply.send(Ok(stream));
                            } else {
                                mux.cancel(stream_id, "transport lost");
                                let _ = reply.send(Err(TunnelError::TransportLost));
                                break 'session "transport lost".to_string();
                            }
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                SessionCommand::Consumed { stream_id, len } => {
                    if let Some(update) = mux.consumed(stream_id, len) {
                        if frame_tx.send(update).await.is_err() {
                            break 'session "transport lost".to_string();
                        }
                    }
                }
                SessionCommand::Cancel { stream_id, reason } => {
                    if let Some(error_frame) = mux.cancel(stream_id, &reason) {
                        debug!(client_id = %id, stream_id, %reason, "Stream cancelled");
                        if frame_tx.send(error_frame).await.is_err() {
                            break 'session "transport lost".to_string();
                        }
                    }
                }
                SessionCommand::Shutdown => {
                    break 'session "shutdown requested".to_string();
                }
            },
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > LIVENESS_TIMEOUT {
                    break 'session "liveness timeout".to_string();
                }
                heartbeat_seq += 1;
                if frame_tx.send(Frame::heartbeat(heartbeat_seq)).await.is_err() {
                    break 'session "transport lost".to_string();
                }
            }
        }
    };

    // Draining: no new streams, every in-flight stream resolves with an
    // explicit error instead of hanging.
    let _ = state_tx.send(SessionState::Draining);
    debug!(client_id = %id, %reason, in_flight = mux.stream_count(), "Session draining");
    mux.fail_all(&reason);

    reader_task.abort();
    let _ = writer_shutdown_tx.send(());
    // A writer stuck on a dead peer is bounded by the grace period; the
    // transport drops with its task either way.
    let _ = tokio::time::timeout(DRAIN_GRACE, writer_task).await;

    registry.unregister(&id, serial).await;
    let _ = state_tx.send(SessionState::Closed);
    info!(client_id = %id, %reason, "Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientRegistry, MemoryStore};
    use crate::tunnel::FrameType;

    fn test_registry() -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::new(
            Arc::new(MemoryStore::new()),
            "test".to_string(),
        ))
    }

    fn request_head() -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            path: "/hello".to_string(),
            headers: Vec::new(),
        }
    }

    /// Next non-heartbeat frame; keepalives interleave freely on the wire
    async fn read_data_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Frame {
        loop {
            let frame = Frame::read_from(reader).await.unwrap();
            if frame.frame_type != FrameType::Heartbeat {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_open_stream_emits_frames_in_order() {
        let (relay_side, mut client_side) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(relay_side);
        let handle = spawn("c1".to_string(), r, w, test_registry());

        let mut stream = handle.open_stream(request_head()).await.unwrap();
        stream
            .send_body_chunk(Bytes::from_static(b"payload"))
            .await
            .unwrap();
        stream.finish_request().await.unwrap();

        let open = read_data_frame(&mut client_side).await;
        assert_eq!(open.frame_type, FrameType::OpenRequest);
        let headers = read_data_frame(&mut client_side).await;
        assert_eq!(headers.frame_type, FrameType::RequestHeaders);
        assert_eq!(headers.stream_id, open.stream_id);
        let chunk = read_data_frame(&mut client_side).await;
        assert_eq!(chunk.frame_type, FrameType::RequestBodyChunk);
        assert_eq!(&chunk.payload[..], b"payload");
        let end = read_data_frame(&mut client_side).await;
        assert_eq!(end.frame_type, FrameType::RequestEnd);
    }

    #[tokio::test]
    async fn test_response_roundtrip() {
        let (relay_side, mut client_side) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(relay_side);
        let handle = spawn("c2".to_string(), r, w, test_registry());

        let mut stream = handle.open_stream(request_head()).await.unwrap();
        stream.finish_request().await.unwrap();

        // Consume the request frames, then answer
        loop {
            let frame = read_data_frame(&mut client_side).await;
            if frame.frame_type == FrameType::RequestEnd {
                break;
            }
        }
        let sid = stream.id();
        let head = ResponseHead {
            status: 200,
            reason: "OK".to_string(),
            headers: Vec::new(),
        };
        Frame::response_headers(sid, &head)
            .unwrap()
            .write_to(&mut client_side)
            .await
            .unwrap();
        Frame::response_chunk(sid, Bytes::from_static(b"hi"))
            .write_to(&mut client_side)
            .await
            .unwrap();
        Frame::response_end(sid)
            .write_to(&mut client_side)
            .await
            .unwrap();

        let got = stream
            .response_head(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.status, 200);

        let chunk = stream.next_body_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hi");
        assert!(stream.next_body_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_loss_fails_in_flight_streams() {
        let (relay_side, mut client_side) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(relay_side);
        let handle = spawn("c3".to_string(), r, w, test_registry());

        let mut stream = handle.open_stream(request_head()).await.unwrap();
        stream.finish_request().await.unwrap();
        loop {
            let frame = read_data_frame(&mut client_side).await;
            if frame.frame_type == FrameType::RequestEnd {
                break;
            }
        }

        // Sever the transport mid-exchange
        drop(client_side);

        let result = stream.response_head(Duration::from_secs(5)).await;
        assert!(result.is_err(), "in-flight stream must fail, not hang");

        handle.closed().await;
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (relay_side, _client_side) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(relay_side);
        let handle = spawn("c4".to_string(), r, w, test_registry());

        handle.shutdown().await;
        handle.closed().await;
        assert_eq!(handle.state(), SessionState::Closed);

        // Second close of an already-closed session has no effect
        handle.shutdown().await;
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_stream_after_shutdown_fails() {
        let (relay_side, _client_side) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(relay_side);
        let handle = spawn("c5".to_string(), r, w, test_registry());

        handle.shutdown().await;
        handle.closed().await;

        assert!(handle.open_stream(request_head()).await.is_err());
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_at_most_one_active_session_per_id() {
        let registry = test_registry();

        let (relay_a, _client_a) = tokio::io::duplex(65536);
        let (ra, wa) = tokio::io::split(relay_a);
        let first = spawn("dup".to_string(), ra, wa, Arc::clone(&registry));
        registry.insert_session(first.clone()).await.unwrap();

        let (relay_b, _client_b) = tokio::io::duplex(65536);
        let (rb, wb) = tokio::io::split(relay_b);
        let second = spawn("dup".to_string(), rb, wb, Arc::clone(&registry));

        assert!(registry.insert_session(second.clone()).await.is_err());
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_session_unregisters_on_close() {
        let registry = test_registry();
        let (relay_side, _client_side) = tokio::io::duplex(65536);
        let (r, w) = tokio::io::split(relay_side);

        let handle = spawn("c6".to_string(), r, w, Arc::clone(&registry));
        registry.insert_session(handle.clone()).await.unwrap();
        assert_eq!(registry.session_count().await, 1);

        handle.shutdown().await;
        handle.closed().await;
        // Unregistration happens before the state flips to Closed
        assert_eq!(registry.session_count().await, 0);
    }
}
