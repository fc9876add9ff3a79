//! Stream multiplexer for the tunnel
//!
//! Owns the per-stream pending-exchange map for one session and correlates
//! inbound frames to the callers waiting on them. The multiplexer is a
//! passive state machine: the owning session task feeds it frames and
//! commands, and it hands back the frames to emit in return. Single-owner
//! discipline means the streams map needs no lock.

use super::stream::{Exchange, StreamPhase};
use super::{Frame, FrameType, TunnelError, CHUNK_CHANNEL_CAPACITY, MAX_STREAMS};
use crate::http::{RequestHead, ResponseHead};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Receiving ends handed to the router for one opened stream
pub struct StreamReceivers {
    /// Resolves with the response head, or the error that ended the exchange
    pub head_rx: oneshot::Receiver<Result<ResponseHead, TunnelError>>,
    /// Lazy, finite, single-consumption body chunk sequence
    pub body_rx: mpsc::Receiver<Result<Bytes, TunnelError>>,
    /// Request-direction window credits granted by the remote end
    pub credit_rx: mpsc::UnboundedReceiver<u32>,
}

/// Multiplexer state for a single stream
struct StreamEntry {
    exchange: Exchange,
    head_tx: Option<oneshot::Sender<Result<ResponseHead, TunnelError>>>,
    body_tx: mpsc::Sender<Result<Bytes, TunnelError>>,
    credit_tx: mpsc::UnboundedSender<u32>,
}

impl StreamEntry {
    /// Resolve the exchange with an error through whichever handoff the
    /// router is currently waiting on.
    fn resolve_error(mut self, err: TunnelError) {
        self.exchange.fail();
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(Err(err));
        } else {
            let _ = self.body_tx.try_send(Err(err));
        }
    }
}

/// Stream multiplexer
pub struct Multiplexer {
    /// Active streams
    streams: HashMap<u32, StreamEntry>,
    /// Next stream ID candidate; allocation wraps and skips IDs in use
    next_stream_id: u32,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1,
        }
    }

    /// Get number of active streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Allocate a fresh stream ID. IDs are reused only after the prior
    /// stream with that ID has fully closed; 0 is reserved for
    /// connection-level frames.
    fn allocate_id(&mut self) -> Result<u32, TunnelError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(TunnelError::StreamsExhausted);
        }
        loop {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if id != 0 && !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Open a new exchange. Returns the allocated ID, the receiving ends for
    /// the caller, and the frames to emit (OpenRequest then RequestHeaders,
    /// in that order).
    pub fn open_stream(
        &mut self,
        head: &RequestHead,
    ) -> Result<(u32, StreamReceivers, Vec<Frame>), TunnelError> {
        let stream_id = self.allocate_id()?;

        let headers_frame = Frame::request_headers(stream_id, head)?;

        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (credit_tx, credit_rx) = mpsc::unbounded_channel();

        let mut exchange = Exchange::new(stream_id);
        exchange.mark_headers_sent();

        self.streams.insert(
            stream_id,
            StreamEntry {
                exchange,
                head_tx: Some(head_tx),
                body_tx,
                credit_tx,
            },
        );

        Ok((
            stream_id,
            StreamReceivers {
                head_rx,
                body_rx,
                credit_rx,
            },
            vec![Frame::open_request(stream_id), headers_frame],
        ))
    }

    /// Handle an incoming frame, returning any frames to emit in response.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Vec<Frame>, TunnelError> {
        match frame.frame_type {
            FrameType::ResponseHeaders => self.handle_response_headers(frame),
            FrameType::ResponseBodyChunk => self.handle_response_chunk(frame),
            FrameType::ResponseEnd => self.handle_response_end(frame),
            FrameType::StreamError => {
                self.handle_stream_error(frame);
                Ok(Vec::new())
            }
            FrameType::WindowUpdate => {
                let increment = frame.decode_window_update()?;
                if let Some(entry) = self.streams.get(&frame.stream_id) {
                    let _ = entry.credit_tx.send(increment);
                }
                Ok(Vec::new())
            }
            FrameType::Heartbeat => Ok(Vec::new()),
            // Request-direction frames never flow toward the relay; a peer
            // sending them is broken but not worth killing the session over.
            _ => Ok(Vec::new()),
        }
    }

    fn handle_response_headers(&mut self, frame: Frame) -> Result<Vec<Frame>, TunnelError> {
        let stream_id = frame.stream_id;
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            // Stale frame for a cancelled stream
            return Ok(Vec::new());
        };

        if entry.exchange.phase() != StreamPhase::HeadersSent {
            return Ok(self.fail_stream(stream_id, "response headers out of order"));
        }

        match frame.decode_response_head() {
            Ok(head) => {
                entry.exchange.mark_body_streaming();
                if let Some(tx) = entry.head_tx.take() {
                    if tx.send(Ok(head)).is_err() {
                        // Router gave up waiting; cancel the exchange
                        return Ok(self.fail_stream(stream_id, "caller gone"));
                    }
                }
                Ok(Vec::new())
            }
            Err(_) => Ok(self.fail_stream(stream_id, "malformed response headers")),
        }
    }

    fn handle_response_chunk(&mut self, frame: Frame) -> Result<Vec<Frame>, TunnelError> {
        let stream_id = frame.stream_id;
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return Ok(Vec::new());
        };

        if entry.exchange.phase() != StreamPhase::BodyStreaming {
            return Ok(self.fail_stream(stream_id, "body chunk before headers"));
        }
        if !entry.exchange.charge_recv(frame.payload.len()) {
            return Ok(self.fail_stream(stream_id, "flow control violation"));
        }

        // The window bounds in-flight chunks below the channel capacity, so
        // try_send can only fail when the router abandoned the stream.
        if entry.body_tx.try_send(Ok(frame.payload)).is_err() {
            return Ok(self.fail_stream(stream_id, "caller gone"));
        }
        Ok(Vec::new())
    }

    fn handle_response_end(&mut self, frame: Frame) -> Result<Vec<Frame>, TunnelError> {
        let stream_id = frame.stream_id;
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return Ok(Vec::new());
        };

        if entry.exchange.phase() != StreamPhase::BodyStreaming {
            return Ok(self.fail_stream(stream_id, "response end before headers"));
        }

        // Dropping the entry closes body_tx; the router observes end-of-body
        // and the stream ID becomes reusable.
        if let Some(mut entry) = self.streams.remove(&stream_id) {
            entry.exchange.complete();
        }
        Ok(Vec::new())
    }

    fn handle_stream_error(&mut self, frame: Frame) {
        if let Some(entry) = self.streams.remove(&frame.stream_id) {
            entry.resolve_error(TunnelError::Stream(frame.error_reason()));
        }
    }

    /// Record bytes consumed by the router for a stream; returns a
    /// WindowUpdate frame once enough credit has accumulated.
    pub fn consumed(&mut self, stream_id: u32, len: usize) -> Option<Frame> {
        let entry = self.streams.get_mut(&stream_id)?;
        entry
            .exchange
            .consumed(len)
            .map(|credit| Frame::window_update(stream_id, credit))
    }

    /// Abort a stream locally (caller cancelled or violated the protocol).
    /// Resolves the local waiter, releases the ID, and returns the
    /// StreamError frame to send to the remote end.
    fn fail_stream(&mut self, stream_id: u32, reason: &str) -> Vec<Frame> {
        if let Some(entry) = self.streams.remove(&stream_id) {
            entry.resolve_error(TunnelError::Stream(reason.to_string()));
            vec![Frame::stream_error(stream_id, reason)]
        } else {
            Vec::new()
        }
    }

    /// Cancel a stream on behalf of the caller. No local waiter is resolved
    /// (the caller initiated this); the remote end is told to stop.
    pub fn cancel(&mut self, stream_id: u32, reason: &str) -> Option<Frame> {
        self.streams.remove(&stream_id).map(|entry| {
            drop(entry);
            Frame::stream_error(stream_id, reason)
        })
    }

    /// Resolve every in-flight stream with an error. Used when the session
    /// drains: no stream may be left hanging.
    pub fn fail_all(&mut self, reason: &str) {
        for (_, entry) in self.streams.drain() {
            entry.resolve_error(TunnelError::Stream(reason.to_string()));
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_head() -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            path: "/hello".to_string(),
            headers: Vec::new(),
        }
    }

    fn response_head() -> ResponseHead {
        ResponseHead {
            status: 200,
            reason: "OK".to_string(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_open_stream_emits_open_then_headers() {
        let mut mux = Multiplexer::new();
        let (id, _rx, frames) = mux.open_stream(&request_head()).unwrap();

        assert_eq!(id, 1);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::OpenRequest);
        assert_eq!(frames[1].frame_type, FrameType::RequestHeaders);
        assert_eq!(mux.stream_count(), 1);
    }

    #[test]
    fn test_stream_ids_monotonic_and_unique() {
        let mut mux = Multiplexer::new();
        let (a, _ra, _) = mux.open_stream(&request_head()).unwrap();
        let (b, _rb, _) = mux.open_stream(&request_head()).unwrap();
        let (c, _rc, _) = mux.open_stream(&request_head()).unwrap();

        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_id_released_after_response_end() {
        let mut mux = Multiplexer::new();
        let (id, mut rx, _) = mux.open_stream(&request_head()).unwrap();

        let head = Frame::response_headers(id, &response_head()).unwrap();
        mux.handle_frame(head).unwrap();
        mux.handle_frame(Frame::response_end(id)).unwrap();

        assert_eq!(mux.stream_count(), 0);
        assert!(rx.head_rx.try_recv().unwrap().is_ok());
        // Closed channel marks the end of the body
        assert!(rx.body_rx.try_recv().is_err());
    }

    #[test]
    fn test_response_delivery() {
        let mut mux = Multiplexer::new();
        let (id, mut rx, _) = mux.open_stream(&request_head()).unwrap();

        mux.handle_frame(Frame::response_headers(id, &response_head()).unwrap())
            .unwrap();
        mux.handle_frame(Frame::response_chunk(id, Bytes::from_static(b"body")))
            .unwrap();
        mux.handle_frame(Frame::response_end(id)).unwrap();

        let head = rx.head_rx.try_recv().unwrap().unwrap();
        assert_eq!(head.status, 200);

        let chunk = rx.body_rx.try_recv().unwrap().unwrap();
        assert_eq!(&chunk[..], b"body");
    }

    #[test]
    fn test_chunk_before_headers_fails_stream() {
        let mut mux = Multiplexer::new();
        let (id, mut rx, _) = mux.open_stream(&request_head()).unwrap();

        let out = mux
            .handle_frame(Frame::response_chunk(id, Bytes::from_static(b"early")))
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame_type, FrameType::StreamError);
        assert_eq!(mux.stream_count(), 0);
        assert!(rx.head_rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_stream_error_resolves_waiter() {
        let mut mux = Multiplexer::new();
        let (id, mut rx, _) = mux.open_stream(&request_head()).unwrap();

        mux.handle_frame(Frame::stream_error(id, "upstream gone"))
            .unwrap();

        match rx.head_rx.try_recv().unwrap() {
            Err(TunnelError::Stream(reason)) => assert_eq!(reason, "upstream gone"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(mux.stream_count(), 0);
    }

    #[test]
    fn test_fail_all_resolves_everything() {
        let mut mux = Multiplexer::new();
        let (_, mut rx1, _) = mux.open_stream(&request_head()).unwrap();
        let (_, mut rx2, _) = mux.open_stream(&request_head()).unwrap();

        mux.fail_all("tunnel transport lost");

        assert!(rx1.head_rx.try_recv().unwrap().is_err());
        assert!(rx2.head_rx.try_recv().unwrap().is_err());
        assert_eq!(mux.stream_count(), 0);
    }

    #[test]
    fn test_stale_frames_ignored() {
        let mut mux = Multiplexer::new();
        let (id, _rx, _) = mux.open_stream(&request_head()).unwrap();
        mux.cancel(id, "caller disconnected");

        // Frames for the cancelled stream are dropped without side effects
        let out = mux
            .handle_frame(Frame::response_headers(id, &response_head()).unwrap())
            .unwrap();
        assert!(out.is_empty());

        let out = mux
            .handle_frame(Frame::response_chunk(id, Bytes::from_static(b"late")))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_window_update_reaches_credit_channel() {
        let mut mux = Multiplexer::new();
        let (id, mut rx, _) = mux.open_stream(&request_head()).unwrap();

        mux.handle_frame(Frame::window_update(id, 4096)).unwrap();
        assert_eq!(rx.credit_rx.try_recv().unwrap(), 4096);
    }
}
