//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and serialization for the BitTorrent
//! peer wire protocol. All communication after the handshake uses these
//! messages.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Total length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | packed piece flags |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//! | 9 | PORT | DHT listen port |
//!
//! A keep-alive message has length 0 and no ID or payload.

use crate::error::DecodeError;
use crate::handshake::Handshake;
use crate::piece::BlockAddress;

use byteorder::{BigEndian, ByteOrder};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_PORT: MessageId = 9;

// Length prefix size in bytes
pub const LENGTH_PREFIX: usize = 4;

/// A peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(BlockAddress),
    Piece { index: u32, begin: u32, data: Vec<u8> },
    Cancel(BlockAddress),
    Port(u16),
}

/// A decoded frame along with its header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Value of the length prefix
    pub declared_size: u32,
    /// Message ID, absent for keep-alive
    pub message_type: Option<MessageId>,
    pub message: Message,
}

impl Message {
    /// Message ID on the wire, if the message has one.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::Handshake(_) | Message::KeepAlive => None,
            Message::Choke => Some(MESSAGE_CHOKE),
            Message::Unchoke => Some(MESSAGE_UNCHOKE),
            Message::Interested => Some(MESSAGE_INTERESTED),
            Message::NotInterested => Some(MESSAGE_NOT_INTERESTED),
            Message::Have(_) => Some(MESSAGE_HAVE),
            Message::Bitfield(_) => Some(MESSAGE_BITFIELD),
            Message::Request(_) => Some(MESSAGE_REQUEST),
            Message::Piece { .. } => Some(MESSAGE_PIECE),
            Message::Cancel(_) => Some(MESSAGE_CANCEL),
            Message::Port(_) => Some(MESSAGE_PORT),
        }
    }

    /// Serialize message.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::Handshake(handshake) => handshake.serialize(),
            Message::KeepAlive => vec![0; LENGTH_PREFIX],
            Message::Choke => encode_fixed(MESSAGE_CHOKE, &[]),
            Message::Unchoke => encode_fixed(MESSAGE_UNCHOKE, &[]),
            Message::Interested => encode_fixed(MESSAGE_INTERESTED, &[]),
            Message::NotInterested => encode_fixed(MESSAGE_NOT_INTERESTED, &[]),
            Message::Have(index) => encode_fixed(MESSAGE_HAVE, &index.to_be_bytes()),
            Message::Bitfield(bytes) => encode_fixed(MESSAGE_BITFIELD, bytes),
            Message::Request(block) => encode_fixed(MESSAGE_REQUEST, &block_payload(block)),
            Message::Piece { index, begin, data } => encode_piece(*index, *begin, data),
            Message::Cancel(block) => encode_fixed(MESSAGE_CANCEL, &block_payload(block)),
            Message::Port(port) => encode_fixed(MESSAGE_PORT, &port.to_be_bytes()),
        }
    }
}

/// Build a length-prefixed message from its ID and payload.
pub fn encode_fixed(id: MessageId, extra: &[u8]) -> Vec<u8> {
    let mut serialized = vec![0; LENGTH_PREFIX + 1];
    BigEndian::write_u32(&mut serialized[..LENGTH_PREFIX], 1 + extra.len() as u32);
    serialized[LENGTH_PREFIX] = id;
    serialized.extend_from_slice(extra);
    serialized
}

/// Build a BITFIELD message from per-piece flags.
///
/// Piece `i` is bit `7 - i % 8` of byte `i / 8`; trailing bits are zero.
pub fn encode_bitfield(flags: &[bool]) -> Vec<u8> {
    let mut bitfield = vec![0u8; flags.len().div_ceil(8)];
    for (i, _) in flags.iter().enumerate().filter(|(_, set)| **set) {
        bitfield[i / 8] |= 1 << (7 - i % 8);
    }
    encode_fixed(MESSAGE_BITFIELD, &bitfield)
}

/// Build a PIECE message carrying one block.
pub fn encode_piece(index: u32, begin: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0; 8];
    BigEndian::write_u32(&mut payload[0..4], index);
    BigEndian::write_u32(&mut payload[4..8], begin);
    payload.extend_from_slice(data);
    encode_fixed(MESSAGE_PIECE, &payload)
}

fn block_payload(block: &BlockAddress) -> [u8; 12] {
    let mut payload = [0; 12];
    BigEndian::write_u32(&mut payload[0..4], block.index);
    BigEndian::write_u32(&mut payload[4..8], block.begin);
    BigEndian::write_u32(&mut payload[8..12], block.length);
    payload
}

fn require(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

fn read_block(payload: &[u8]) -> Result<BlockAddress, DecodeError> {
    require(payload, 12)?;
    Ok(BlockAddress::new(
        BigEndian::read_u32(&payload[0..4]),
        BigEndian::read_u32(&payload[4..8]),
        BigEndian::read_u32(&payload[8..12]),
    ))
}

/// Deserialize a length-prefixed message.
///
/// # Errors
///
/// Returns `Truncated` if the buffer is shorter than its length prefix or than
/// the fixed fields of its message type, and `UnknownMessageType` for IDs
/// outside the protocol.
pub fn decode_message(raw: &[u8]) -> Result<DecodedMessage, DecodeError> {
    require(raw, LENGTH_PREFIX)?;
    let declared_size = BigEndian::read_u32(&raw[..LENGTH_PREFIX]);

    if declared_size == 0 {
        return Ok(DecodedMessage {
            declared_size,
            message_type: None,
            message: Message::KeepAlive,
        });
    }

    let frame_len = LENGTH_PREFIX + declared_size as usize;
    require(raw, frame_len)?;
    let id = raw[LENGTH_PREFIX];
    let payload = &raw[LENGTH_PREFIX + 1..frame_len];

    let message = match id {
        MESSAGE_CHOKE => Message::Choke,
        MESSAGE_UNCHOKE => Message::Unchoke,
        MESSAGE_INTERESTED => Message::Interested,
        MESSAGE_NOT_INTERESTED => Message::NotInterested,
        MESSAGE_HAVE => {
            require(payload, 4)?;
            Message::Have(BigEndian::read_u32(&payload[0..4]))
        }
        MESSAGE_BITFIELD => Message::Bitfield(payload.to_vec()),
        MESSAGE_REQUEST => Message::Request(read_block(payload)?),
        MESSAGE_PIECE => {
            require(payload, 8)?;
            Message::Piece {
                index: BigEndian::read_u32(&payload[0..4]),
                begin: BigEndian::read_u32(&payload[4..8]),
                data: payload[8..].to_vec(),
            }
        }
        MESSAGE_CANCEL => Message::Cancel(read_block(payload)?),
        MESSAGE_PORT => {
            require(payload, 2)?;
            Message::Port(BigEndian::read_u16(&payload[0..2]))
        }
        _ => return Err(DecodeError::UnknownMessageType(id)),
    };

    Ok(DecodedMessage {
        declared_size,
        message_type: Some(id),
        message,
    })
}

/// Piece indices whose bit is set in a bitfield, scanning bytes MSB-first.
pub fn bitfield_pieces(bitfield: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bitfield.iter().enumerate().flat_map(|(byte_index, &byte)| {
        (0..8u32)
            .filter(move |offset| (byte >> (7 - *offset)) & 1 != 0)
            .map(move |offset| byte_index as u32 * 8 + offset)
    })
}
