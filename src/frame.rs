//! # Frame Reassembly
//!
//! TCP delivers a continuous byte stream with no message boundaries. The frame
//! buffer accumulates raw reads and slices off one complete frame at a time:
//!
//! - the handshake frame, `pstrlen + 49` bytes, expected once per connection;
//! - every later frame, `length prefix + 4` bytes.
//!
//! A peer may answer a handshake we resend mid-stream. Such a frame is
//! recognised by its protocol string, since no length prefix starting with
//! `pstrlen = 19` fits under [`MAX_FRAME_LEN`].

use crate::error::DecodeError;
use crate::handshake::{HANDSHAKE_OVERHEAD, PROTOCOL_ID};
use crate::message::LENGTH_PREFIX;

use byteorder::{BigEndian, ByteOrder};

/// Largest frame accepted from a peer (a 16KB block plus headers is far below).
pub const MAX_FRAME_LEN: usize = 1 << 21;

/// Accumulates stream bytes and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    handshake_pending: bool,
}

impl FrameBuffer {
    /// Creates a buffer whose first frame is a handshake.
    pub fn new() -> FrameBuffer {
        FrameBuffer {
            buf: vec![],
            handshake_pending: true,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the next frame is expected to be a handshake.
    pub fn handshake_pending(&self) -> bool {
        self.handshake_pending
    }

    /// Length of the frame at the front of the buffer, once it can be known.
    fn expected_len(&self) -> Result<Option<usize>, DecodeError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let handshake = if self.handshake_pending {
            true
        } else if self.buf[0] as usize == PROTOCOL_ID.len() {
            if self.buf.len() <= PROTOCOL_ID.len() {
                return Ok(None);
            }
            &self.buf[1..=PROTOCOL_ID.len()] == PROTOCOL_ID
        } else {
            false
        };

        let len = if handshake {
            self.buf[0] as usize + HANDSHAKE_OVERHEAD
        } else {
            BigEndian::read_u32(&self.buf[..LENGTH_PREFIX]) as usize + LENGTH_PREFIX
        };

        if len > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(len));
        }
        Ok(Some(len))
    }

    /// Slice the next complete frame off the buffer, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` if the peer declares an oversized frame.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let len = match self.expected_len()? {
            Some(len) if self.buf.len() >= len => len,
            _ => return Ok(None),
        };

        let rest = self.buf.split_off(len);
        let frame = std::mem::replace(&mut self.buf, rest);
        self.handshake_pending = false;

        Ok(Some(frame))
    }
}
