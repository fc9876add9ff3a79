//! Protocol definitions and constants
//!
//! Covers the tunnel-establishment handshake (length-prefixed JSON control
//! messages exchanged before framing starts) and the timing constants shared
//! by both ends of a tunnel.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum handshake message size (16 KB)
pub const MAX_MESSAGE_SIZE: usize = 16384;

/// Time allowed for the tunnel-establishment handshake to complete
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between keepalive frames
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A session with no inbound frame (data or heartbeat) for this long is
/// considered dead and drained
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);

/// Time the router waits for response headers on a stream
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle bound on body-chunk relaying, distinct from the header timeout
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Grace period for a draining session to resolve in-flight streams
pub const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Time allowed for the client to reach its local server
pub const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First message on a tunnel connection, client → relay.
///
/// A fresh client sends only its auth token; a reconnecting client also
/// presents the ID and resume key it was issued, which lets it keep its
/// public URL across transport loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub version: u8,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_key: Option<String>,
}

/// Handshake reply, relay → client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeReply {
    Welcome { client_id: String, resume_key: String },
    Reject { reason: String },
}

/// Write a length-prefixed JSON control message
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body.len()));
    }
    let len_bytes = (body.len() as u16).to_be_bytes();
    writer.write_all(&len_bytes).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed JSON control message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let hello = ClientHello {
            version: PROTOCOL_VERSION,
            token: "secret".to_string(),
            client_id: None,
            resume_key: None,
        };

        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &hello).await.unwrap();

        let received: ClientHello = read_message(&mut b).await.unwrap();
        assert_eq!(received.token, "secret");
        assert!(received.client_id.is_none());
    }

    #[tokio::test]
    async fn test_reply_variants() {
        let reply = HandshakeReply::Welcome {
            client_id: "abc".to_string(),
            resume_key: "key".to_string(),
        };

        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &reply).await.unwrap();

        match read_message(&mut b).await.unwrap() {
            HandshakeReply::Welcome { client_id, .. } => assert_eq!(client_id, "abc"),
            HandshakeReply::Reject { .. } => panic!("expected welcome"),
        }
    }
}
