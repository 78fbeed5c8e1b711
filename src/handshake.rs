//! # BitTorrent Handshake Protocol
//!
//! This module implements the initial handshake used to establish
//! communication between BitTorrent peers.
//!
//! ## Message Format
//!
//! The handshake is a fixed 68-byte message:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19)
//! - **pstr**: 19 bytes - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros, no extensions are negotiated
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! Unlike every other peer message, the handshake carries no 4-byte length
//! prefix: its size is `pstrlen + 49`.

use crate::error::DecodeError;

pub const PROTOCOL_ID: &[u8] = b"BitTorrent protocol";

/// Size of a handshake using the standard protocol string.
pub const HANDSHAKE_LEN: usize = 68;

/// Bytes of a handshake besides the protocol string.
pub const HANDSHAKE_OVERHEAD: usize = 49;

/// Represents a BitTorrent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 8 reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte unique identifier of the sender
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new handshake with no extension bits set.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68 wire bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(HANDSHAKE_LEN);

        serialized.push(PROTOCOL_ID.len() as u8);
        serialized.extend_from_slice(PROTOCOL_ID);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }
}

/// Encodes our handshake for a torrent.
pub fn encode_handshake(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> Vec<u8> {
    Handshake::new(*info_hash, *peer_id).serialize()
}

/// Whether a frame is a BitTorrent handshake.
///
/// The frame length must equal `pstrlen + 49` and the protocol string must be
/// "BitTorrent protocol".
pub fn is_handshake(buf: &[u8]) -> bool {
    match buf.first() {
        Some(&pstrlen) => {
            buf.len() == pstrlen as usize + HANDSHAKE_OVERHEAD
                && buf.get(1..1 + PROTOCOL_ID.len()) == Some(PROTOCOL_ID)
        }
        None => false,
    }
}

/// Deserializes a complete handshake frame.
///
/// # Errors
///
/// Returns `InvalidHandshake` unless [`is_handshake`] accepts the frame.
pub fn deserialize_handshake(buf: &[u8]) -> Result<Handshake, DecodeError> {
    if !is_handshake(buf) {
        return Err(DecodeError::InvalidHandshake);
    }

    let pstr_end = 1 + buf[0] as usize;
    let mut reserved = [0; 8];
    reserved.copy_from_slice(&buf[pstr_end..pstr_end + 8]);
    let mut info_hash = [0; 20];
    info_hash.copy_from_slice(&buf[pstr_end + 8..pstr_end + 28]);
    let mut peer_id = [0; 20];
    peer_id.copy_from_slice(&buf[pstr_end + 28..pstr_end + 48]);

    Ok(Handshake {
        reserved,
        info_hash,
        peer_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_layout() {
        let encoded = encode_handshake(&[1; 20], &[2; 20]);

        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[1..20], b"BitTorrent protocol");
        assert_eq!(&encoded[20..28], &[0; 8]);
        assert_eq!(&encoded[28..48], &[1; 20]);
        assert_eq!(&encoded[48..68], &[2; 20]);
    }

    #[test]
    fn recognises_handshake() {
        let encoded = encode_handshake(&[1; 20], &[2; 20]);
        assert!(is_handshake(&encoded));
        assert!(!is_handshake(&encoded[..67]));
        assert!(!is_handshake(&[]));

        let mut wrong_protocol = encoded.clone();
        wrong_protocol[5] = b'X';
        assert!(!is_handshake(&wrong_protocol));
    }

    #[test]
    fn deserializes_fields() {
        let mut handshake = Handshake::new([9; 20], [4; 20]);
        handshake.reserved[5] = 0x10;

        let decoded = deserialize_handshake(&handshake.serialize()).unwrap();
        assert_eq!(decoded, handshake);
        assert_eq!(
            deserialize_handshake(&[0; 68]),
            Err(DecodeError::InvalidHandshake)
        );
    }
}
