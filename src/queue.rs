//! # Block Request Queue
//!
//! Each peer session keeps its own FIFO of blocks waiting to be requested from
//! its peer. Pieces announced by the peer (HAVE, BITFIELD) are expanded into
//! their blocks and appended in block order.
//!
//! The queue also carries the choke state of the connection: while the peer
//! chokes us, the request pump must not dequeue anything.

use crate::error::PieceError;
use crate::piece::BlockAddress;
use crate::torrent::TorrentDescriptor;

use std::collections::VecDeque;
use std::sync::Arc;

/// FIFO of blocks awaiting a REQUEST message to one peer.
#[derive(Debug)]
pub struct RequestQueue {
    torrent: Arc<TorrentDescriptor>,
    choked: bool,
    blocks: VecDeque<BlockAddress>,
}

impl RequestQueue {
    /// Creates an empty queue. Peers start out choking us.
    pub fn new(torrent: Arc<TorrentDescriptor>) -> RequestQueue {
        RequestQueue {
            torrent,
            choked: true,
            blocks: VecDeque::new(),
        }
    }

    /// Append every block of a piece, in block order.
    ///
    /// # Errors
    ///
    /// Returns `PieceOutOfRange` if the torrent has no such piece.
    pub fn enqueue(&mut self, index: u32) -> Result<(), PieceError> {
        let blocks = self.torrent.blocks(index)?;
        self.blocks.extend(blocks);
        Ok(())
    }

    /// Remove and return the front block.
    pub fn dequeue(&mut self) -> Result<BlockAddress, PieceError> {
        self.blocks.pop_front().ok_or(PieceError::EmptyQueue)
    }

    /// Return the front block without removing it.
    pub fn peek(&self) -> Result<BlockAddress, PieceError> {
        self.blocks.front().copied().ok_or(PieceError::EmptyQueue)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    /// Drop every queued block, used when a connection is replaced.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
