//! Tunnel layer - multiplexed request/response exchanges
//!
//! Provides:
//! - Frame encoding/decoding
//! - Per-exchange stream state and flow-control windows
//! - The demultiplexer that correlates frames to waiting callers

mod frame;
mod multiplexer;
mod stream;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use multiplexer::{Multiplexer, StreamReceivers};
pub use stream::{chunk_cost, Exchange, SendBudget, StreamPhase};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream limit reached")]
    StreamsExhausted,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Flow control violation")]
    FlowControl,

    #[error("Stream failed: {0}")]
    Stream(String),

    #[error("Session not active")]
    NotActive,

    #[error("Tunnel transport lost")]
    TransportLost,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Maximum number of concurrent streams per session
pub const MAX_STREAMS: usize = 1024;

/// Initial flow-control window per stream direction (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 262144;

/// Minimum window cost charged per chunk. Caps in-flight chunk count at
/// `DEFAULT_WINDOW_SIZE / MIN_CHUNK_COST`, so bounded delivery channels of
/// that capacity cannot overflow for a compliant peer.
pub const MIN_CHUNK_COST: u32 = 64;

/// Capacity of per-stream chunk delivery channels
pub const CHUNK_CHANNEL_CAPACITY: usize = (DEFAULT_WINDOW_SIZE / MIN_CHUNK_COST) as usize;
