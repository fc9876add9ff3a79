//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |         Stream ID (4B)            |
//! +--------+--------+--------+--------+--------+
//! |    Length (2B)  |        Payload ...       |
//! +--------+--------+--------+--------+--------+
//! ```
//!
//! Frames for different stream IDs may interleave arbitrarily on the wire;
//! frames for the same stream ID are never reordered relative to each other.

use super::TunnelError;
use crate::http::{RequestHead, ResponseHead};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload size per frame (16 KB)
pub const MAX_PAYLOAD_SIZE: usize = 16384;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Relay opens a new exchange on a stream ID
    OpenRequest = 0x00,
    /// Serialized request head (method, path, headers)
    RequestHeaders = 0x01,
    /// Request body chunk
    RequestBodyChunk = 0x02,
    /// Request fully sent
    RequestEnd = 0x03,
    /// Serialized response head (status, headers)
    ResponseHeaders = 0x04,
    /// Response body chunk
    ResponseBodyChunk = 0x05,
    /// Response fully sent; releases the stream ID
    ResponseEnd = 0x06,
    /// Explicit failure; the exchange never completes
    StreamError = 0x07,
    /// Flow-control credit for a stream direction
    WindowUpdate = 0x08,
    /// Keepalive
    Heartbeat = 0x09,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::OpenRequest),
            0x01 => Ok(FrameType::RequestHeaders),
            0x02 => Ok(FrameType::RequestBodyChunk),
            0x03 => Ok(FrameType::RequestEnd),
            0x04 => Ok(FrameType::ResponseHeaders),
            0x05 => Ok(FrameType::ResponseBodyChunk),
            0x06 => Ok(FrameType::ResponseEnd),
            0x07 => Ok(FrameType::StreamError),
            0x08 => Ok(FrameType::WindowUpdate),
            0x09 => Ok(FrameType::Heartbeat),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for connection-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    fn new(frame_type: FrameType, stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    /// Create an open-request frame
    pub fn open_request(stream_id: u32) -> Self {
        Self::new(FrameType::OpenRequest, stream_id, Bytes::new())
    }

    /// Create a request-headers frame carrying the serialized head
    pub fn request_headers(stream_id: u32, head: &RequestHead) -> Result<Self, TunnelError> {
        let payload = serde_json::to_vec(head)?;
        Ok(Self::new(
            FrameType::RequestHeaders,
            stream_id,
            Bytes::from(payload),
        ))
    }

    /// Create a request body chunk frame
    pub fn request_chunk(stream_id: u32, data: Bytes) -> Self {
        Self::new(FrameType::RequestBodyChunk, stream_id, data)
    }

    /// Create a request-end frame
    pub fn request_end(stream_id: u32) -> Self {
        Self::new(FrameType::RequestEnd, stream_id, Bytes::new())
    }

    /// Create a response-headers frame carrying the serialized head
    pub fn response_headers(stream_id: u32, head: &ResponseHead) -> Result<Self, TunnelError> {
        let payload = serde_json::to_vec(head)?;
        Ok(Self::new(
            FrameType::ResponseHeaders,
            stream_id,
            Bytes::from(payload),
        ))
    }

    /// Create a response body chunk frame
    pub fn response_chunk(stream_id: u32, data: Bytes) -> Self {
        Self::new(FrameType::ResponseBodyChunk, stream_id, data)
    }

    /// Create a response-end frame
    pub fn response_end(stream_id: u32) -> Self {
        Self::new(FrameType::ResponseEnd, stream_id, Bytes::new())
    }

    /// Create a stream-error frame with a reason string
    pub fn stream_error(stream_id: u32, reason: &str) -> Self {
        Self::new(
            FrameType::StreamError,
            stream_id,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Create a window-update frame granting `increment` bytes of credit
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self::new(FrameType::WindowUpdate, stream_id, payload.freeze())
    }

    /// Create a heartbeat frame
    pub fn heartbeat(seq: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(seq);
        Self::new(FrameType::Heartbeat, 0, payload.freeze())
    }

    /// Decode the request head out of a RequestHeaders payload
    pub fn decode_request_head(&self) -> Result<RequestHead, TunnelError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the response head out of a ResponseHeaders payload
    pub fn decode_response_head(&self) -> Result<ResponseHead, TunnelError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the credit increment out of a WindowUpdate payload
    pub fn decode_window_update(&self) -> Result<u32, TunnelError> {
        if self.payload.len() < 4 {
            return Err(TunnelError::InvalidFrame(
                "Short window update".to_string(),
            ));
        }
        let mut buf = self.payload.clone();
        Ok(buf.get_u32())
    }

    /// Stream-error reason string (lossy)
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from a buffer, returning None if incomplete
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let payload_len = u16::from_be_bytes([buf[5], buf[6]]) as usize;

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }

    /// Read one frame off the transport
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let frame_type = FrameType::try_from(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let payload_len = u16::from_be_bytes([header[5], header[6]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            frame_type,
            stream_id,
            payload: Bytes::from(payload),
        })
    }

    /// Write one frame to the transport
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(
                self.payload.len(),
                MAX_PAYLOAD_SIZE,
            ));
        }
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}
