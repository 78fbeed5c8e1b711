//! # Error Types
//!
//! Typed errors for the protocol core. Application layers (command line,
//! tracker announce, torrent loading) wrap these in `anyhow::Error`.
//!
//! | Error | Raised by | Recovery |
//! |-------|-----------|----------|
//! | `DecodeError` | message codec, frame buffer | session closed |
//! | `PieceError` | piece tracker, request queue, descriptor | contract violation |
//! | `SessionError` | peer session | peer abandoned or reconnected |

use std::io;

use thiserror::Error;

/// Failure to decode a frame received from a peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends before the structure it declares.
    #[error("truncated message: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    /// The message id is not part of the peer wire protocol.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    /// The buffer is not a valid BitTorrent handshake.
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
}

/// Contract violations on pieces, blocks and queues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PieceError {
    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),
    #[error("block at offset {begin} out of range for piece {index}")]
    BlockOutOfRange { index: u32, begin: u32 },
    #[error("block queue is empty")]
    EmptyQueue,
    #[error("progress shape does not match torrent")]
    ShapeMismatch,
}

/// Reasons a peer session stops talking to its peer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to peer after {0} attempts")]
    Connect(u32),
    #[error("handshake with peer failed: {0}")]
    Handshake(String),
    #[error("peer timed out {0} times in a row")]
    TimeoutBudget(u32),
    #[error("peer closed the connection")]
    StreamClosed,
    #[error("malformed frame from peer: {0}")]
    Decode(#[from] DecodeError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] PieceError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Returns true for read deadlines expiring, which the session retries.
    pub fn is_timeout(&self) -> bool {
        match self {
            SessionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
