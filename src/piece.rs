//! # BitTorrent Piece Tracking
//!
//! This module keeps track of which blocks of which pieces have been requested
//! from peers and which have been received. A single [`PieceTracker`] is shared
//! by every peer session of a download.
//!
//! ## Blocks
//!
//! Pieces are downloaded in smaller blocks (16KB). A block is addressed by its
//! piece index, its byte offset within the piece and its length. The block
//! index within a piece is `begin / BLOCK_SIZE`.
//!
//! ## Request Tracking
//!
//! Two boolean matrices indexed by `[piece][block]` record requested and
//! received blocks. When every block has nominally been requested, the
//! requested matrix is rebuilt from the received one so that requests lost to
//! dead peers are issued again.
//!
//! ## Locking
//!
//! The matrices live behind one mutex. Operations that read then write, such as
//! checking whether a block is needed and marking it requested, hold the lock
//! for the whole operation so two sessions never claim the same block.

use crate::error::PieceError;
use crate::torrent::TorrentDescriptor;

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Standard block size for piece downloads (16KB).
pub const BLOCK_SIZE: u32 = 16384;

/// Location of a block within the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddress {
    /// Zero-based index of the piece
    pub index: u32,
    /// Byte offset of the block within the piece
    pub begin: u32,
    /// Length of the block in bytes
    pub length: u32,
}

impl BlockAddress {
    pub fn new(index: u32, begin: u32, length: u32) -> BlockAddress {
        BlockAddress {
            index,
            begin,
            length,
        }
    }

    /// Index of the block within its piece.
    pub fn block_index(&self) -> u32 {
        self.begin / BLOCK_SIZE
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "piece {} [{}:{}]",
            self.index,
            self.begin,
            self.begin as u64 + self.length as u64
        )
    }
}

/// Requested and received flags for every block of a torrent.
///
/// This is the unlocked state behind [`PieceTracker`]; every method assumes
/// the caller has exclusive access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMatrix {
    requested: Vec<Vec<bool>>,
    received: Vec<Vec<bool>>,
    nb_requested: usize,
    nb_received: usize,
    nb_blocks: usize,
}

impl BlockMatrix {
    /// Allocates all-false matrices, one row per piece sized by its block count.
    pub fn new(torrent: &TorrentDescriptor) -> BlockMatrix {
        let rows: Vec<Vec<bool>> = (0..torrent.piece_count())
            .map(|index| {
                let nb_blocks = torrent.blocks_per_piece(index).unwrap_or(0);
                vec![false; nb_blocks as usize]
            })
            .collect();
        BlockMatrix::from_rows(rows)
    }

    fn from_rows(rows: Vec<Vec<bool>>) -> BlockMatrix {
        let nb_blocks = rows.iter().map(Vec::len).sum();
        BlockMatrix {
            requested: rows.clone(),
            received: rows,
            nb_requested: 0,
            nb_received: 0,
            nb_blocks,
        }
    }

    fn slot(&self, block: &BlockAddress) -> Result<(usize, usize), PieceError> {
        let piece = block.index as usize;
        let row = self
            .received
            .get(piece)
            .ok_or(PieceError::PieceOutOfRange(block.index))?;
        let index = block.block_index() as usize;
        if index >= row.len() {
            return Err(PieceError::BlockOutOfRange {
                index: block.index,
                begin: block.begin,
            });
        }
        Ok((piece, index))
    }

    fn row(&self, piece: u32) -> Result<&[bool], PieceError> {
        self.received
            .get(piece as usize)
            .map(Vec::as_slice)
            .ok_or(PieceError::PieceOutOfRange(piece))
    }

    pub fn mark_requested(&mut self, block: &BlockAddress) -> Result<(), PieceError> {
        let (piece, index) = self.slot(block)?;
        if !self.requested[piece][index] {
            self.requested[piece][index] = true;
            self.nb_requested += 1;
        }
        Ok(())
    }

    pub fn mark_received(&mut self, block: &BlockAddress) -> Result<(), PieceError> {
        let (piece, index) = self.slot(block)?;
        if !self.received[piece][index] {
            self.received[piece][index] = true;
            self.nb_received += 1;
        }
        Ok(())
    }

    /// Whether a block should still be requested.
    ///
    /// Once every block has been requested, the requested flags are reset to
    /// the received flags first, so blocks that were requested but never
    /// arrived become needed again.
    pub fn needed(&mut self, block: &BlockAddress) -> Result<bool, PieceError> {
        let (piece, index) = self.slot(block)?;
        if self.nb_requested == self.nb_blocks {
            self.requested.clone_from(&self.received);
            self.nb_requested = self.nb_received;
        }
        Ok(!self.requested[piece][index])
    }

    /// Checks whether a block is needed and marks it requested if so.
    pub fn claim(&mut self, block: &BlockAddress) -> Result<bool, PieceError> {
        let needed = self.needed(block)?;
        if needed {
            self.mark_requested(block)?;
        }
        Ok(needed)
    }

    /// Marks a block received and returns true if this completed its piece.
    pub fn record_received(&mut self, block: &BlockAddress) -> Result<bool, PieceError> {
        let (piece, index) = self.slot(block)?;
        if self.received[piece][index] {
            return Ok(false);
        }
        self.mark_received(block)?;
        self.piece_is_done(block.index)
    }

    pub fn piece_is_done(&self, piece: u32) -> Result<bool, PieceError> {
        Ok(self.row(piece)?.iter().all(|received| *received))
    }

    pub fn is_done(&self) -> bool {
        self.nb_received == self.nb_blocks
    }

    /// Clears both flags for every block of one piece.
    pub fn reset(&mut self, piece: u32) -> Result<(), PieceError> {
        let index = piece as usize;
        if index >= self.received.len() {
            return Err(PieceError::PieceOutOfRange(piece));
        }

        let requested = self.requested[index].iter().filter(|r| **r).count();
        let received = self.received[index].iter().filter(|r| **r).count();
        self.requested[index].fill(false);
        self.received[index].fill(false);
        self.nb_requested -= requested;
        self.nb_received -= received;

        Ok(())
    }

    /// Percentage of blocks received, rounded to the nearest integer.
    pub fn percent_done(&self) -> u8 {
        if self.nb_blocks == 0 {
            return 100;
        }
        ((self.nb_received * 100 + self.nb_blocks / 2) / self.nb_blocks) as u8
    }

    pub fn requested(&self) -> &[Vec<bool>] {
        &self.requested
    }

    pub fn received(&self) -> &[Vec<bool>] {
        &self.received
    }

    /// Replaces the received flags with a previously saved snapshot.
    ///
    /// Requested flags are set to the same values, since received blocks never
    /// need requesting.
    pub fn restore(&mut self, received: Vec<Vec<bool>>) -> Result<(), PieceError> {
        let same_shape = received.len() == self.received.len()
            && received
                .iter()
                .zip(&self.received)
                .all(|(saved, row)| saved.len() == row.len());
        if !same_shape {
            return Err(PieceError::ShapeMismatch);
        }

        let nb_received = received.iter().flatten().filter(|r| **r).count();
        self.requested.clone_from(&received);
        self.received = received;
        self.nb_requested = nb_received;
        self.nb_received = nb_received;

        Ok(())
    }
}

/// Shared piece tracker: a [`BlockMatrix`] behind one mutex.
#[derive(Debug)]
pub struct PieceTracker {
    state: Mutex<BlockMatrix>,
    /// Held across a progress snapshot and its save
    saving: Mutex<()>,
}

impl PieceTracker {
    pub fn new(torrent: &TorrentDescriptor) -> PieceTracker {
        PieceTracker {
            state: Mutex::new(BlockMatrix::new(torrent)),
            saving: Mutex::new(()),
        }
    }

    /// Locks the matrices for a compound operation.
    ///
    /// A session that panicked while holding the lock cannot leave the
    /// matrices half-updated, so a poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, BlockMatrix> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_requested(&self, block: &BlockAddress) -> Result<(), PieceError> {
        self.lock().mark_requested(block)
    }

    pub fn mark_received(&self, block: &BlockAddress) -> Result<(), PieceError> {
        self.lock().mark_received(block)
    }

    pub fn needed(&self, block: &BlockAddress) -> Result<bool, PieceError> {
        self.lock().needed(block)
    }

    /// Atomically checks `needed` and marks the block requested.
    pub fn claim(&self, block: &BlockAddress) -> Result<bool, PieceError> {
        self.lock().claim(block)
    }

    pub fn record_received(&self, block: &BlockAddress) -> Result<bool, PieceError> {
        self.lock().record_received(block)
    }

    pub fn piece_is_done(&self, piece: u32) -> Result<bool, PieceError> {
        self.lock().piece_is_done(piece)
    }

    pub fn is_done(&self) -> bool {
        self.lock().is_done()
    }

    pub fn reset(&self, piece: u32) -> Result<(), PieceError> {
        self.lock().reset(piece)
    }

    pub fn percent_done(&self) -> u8 {
        self.lock().percent_done()
    }

    /// Copy of the received flags, for resume persistence.
    pub fn received_snapshot(&self) -> Vec<Vec<bool>> {
        self.lock().received().to_vec()
    }

    pub fn restore(&self, received: Vec<Vec<bool>>) -> Result<(), PieceError> {
        self.lock().restore(received)
    }

    /// Hands a snapshot of the received flags to `save`.
    ///
    /// Saves run one at a time and each takes its snapshot once it holds the
    /// turn, so saved snapshots follow tracker order.
    pub fn save_progress<E>(
        &self,
        save: impl FnOnce(&[Vec<bool>]) -> Result<(), E>,
    ) -> Result<(), E> {
        let _turn = self.saving.lock().unwrap_or_else(PoisonError::into_inner);
        let received = self.received_snapshot();
        save(&received)
    }
}
