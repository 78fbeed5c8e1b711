//! # Torrent Descriptor
//!
//! This module decodes `.torrent` metadata files and exposes the immutable
//! description of a download that the rest of the client works from.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce** / **announce-list**: Tracker URLs for peer discovery
//! - **info**: Dictionary with file information and piece hashes
//! - **pieces**: Concatenated SHA-1 hashes for integrity verification
//! - **piece length**: Size of each piece (typically 256KB-1MB)
//! - **length** or **files**: Single file size, or a list of files with paths
//! - **name**: Suggested file or directory name
//!
//! ## Piece Geometry
//!
//! All pieces have the same length except possibly the last one, which holds
//! whatever remains of the total length. Pieces are split into 16KB blocks,
//! the unit actually requested from peers.

use crate::error::PieceError;
use crate::piece::{BlockAddress, BLOCK_SIZE};

use anyhow::{anyhow, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser, value::Value};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use std::fs;
use std::path::Path;

// Size of SHA-1 hash in bytes
pub const SHA1_HASH_SIZE: usize = 20;

/// A file of the torrent, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path segments relative to the torrent root
    pub path: Vec<String>,
    /// Size of the file in bytes
    pub length: u64,
}

/// Immutable description of a torrent: file layout, piece hashes and trackers.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    name: String,
    files: Vec<FileEntry>,
    total_length: u64,
    piece_length: u32,
    pieces: Vec<u8>,
    info_hash: [u8; 20],
    announce: Vec<String>,
    /// True when the info dictionary lists several files.
    multi_file: bool,
}

#[derive(Deserialize, Serialize)]
struct BencodeFile {
    length: u64,
    path: Vec<String>,
}

#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes, single file mode
    #[serde(default)]
    length: Option<u64>,
    // Files of the torrent, multi file mode
    #[serde(default)]
    files: Option<Vec<BencodeFile>>,
    // Suggested file or directory name
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Kept raw so the info hash covers every key, known or not
    info: Value,
}

impl TorrentDescriptor {
    /// Builds a descriptor from its parts, validating the piece geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the piece length is zero, the hashes are not a
    /// whole number of SHA-1 digests, or the number of hashes does not match
    /// the number of pieces implied by the file lengths.
    pub fn new(
        name: impl Into<String>,
        files: Vec<FileEntry>,
        piece_length: u32,
        pieces: Vec<u8>,
        info_hash: [u8; 20],
        announce: Vec<String>,
    ) -> Result<TorrentDescriptor> {
        if piece_length == 0 {
            return Err(anyhow!("torrent has a zero piece length"));
        }
        if files.is_empty() {
            return Err(anyhow!("torrent has no files"));
        }
        if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent piece hashes are truncated"));
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected = total_length.div_ceil(piece_length as u64);
        let nb_hashes = (pieces.len() / SHA1_HASH_SIZE) as u64;
        if nb_hashes != expected {
            return Err(anyhow!(
                "torrent has {} piece hashes but {} pieces",
                nb_hashes,
                expected
            ));
        }

        let multi_file = files.len() > 1;
        Ok(TorrentDescriptor {
            name: name.into(),
            files,
            total_length,
            piece_length,
            pieces,
            info_hash,
            announce,
            multi_file,
        })
    }

    /// Open and decode a `.torrent` file.
    pub fn from_file(filepath: &Path) -> Result<TorrentDescriptor> {
        let buf = match fs::read(filepath) {
            Ok(buf) => buf,
            Err(e) => return Err(anyhow!("could not read torrent {:?}: {}", filepath, e)),
        };
        TorrentDescriptor::from_bytes(&buf)
    }

    /// Decode bencoded torrent metadata.
    pub fn from_bytes(buf: &[u8]) -> Result<TorrentDescriptor> {
        let bencode = match de::from_bytes::<BencodeTorrent>(buf) {
            Ok(bencode) => bencode,
            Err(e) => return Err(anyhow!("could not decode torrent: {}", e)),
        };

        // Hash the info dictionary exactly as it was encoded
        let info_buf = ser::to_bytes(&bencode.info)?;
        let mut hasher = Sha1::new();
        hasher.update(&info_buf);
        let info_hash: [u8; 20] = hasher.finalize().into();

        let info = match de::from_bytes::<BencodeInfo>(&info_buf) {
            Ok(info) => info,
            Err(e) => return Err(anyhow!("could not decode torrent info: {}", e)),
        };

        let (files, multi_file) = match (info.length, info.files) {
            (Some(length), None) => (
                vec![FileEntry {
                    path: vec![info.name.clone()],
                    length,
                }],
                false,
            ),
            (None, Some(files)) if !files.is_empty() => (
                files
                    .into_iter()
                    .map(|f| FileEntry {
                        path: f.path,
                        length: f.length,
                    })
                    .collect(),
                true,
            ),
            _ => return Err(anyhow!("torrent must have either a length or a files list")),
        };

        let announce = announce_urls(&bencode.announce, bencode.announce_list);
        if announce.is_empty() {
            return Err(anyhow!("torrent has no announce or announce-list"));
        }

        let mut descriptor = TorrentDescriptor::new(
            info.name,
            files,
            info.piece_length,
            info.pieces.into_vec(),
            info_hash,
            announce,
        )?;
        descriptor.multi_file = multi_file;

        Ok(descriptor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Whether files live under a directory named after the torrent.
    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn announce(&self) -> &[String] {
        &self.announce
    }

    /// Number of pieces, `ceil(total_length / piece_length)`.
    pub fn piece_count(&self) -> u32 {
        (self.pieces.len() / SHA1_HASH_SIZE) as u32
    }

    /// Get piece length.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece index.
    ///
    pub fn piece_len(&self, index: u32) -> Result<u32, PieceError> {
        let count = self.piece_count();
        if index >= count {
            return Err(PieceError::PieceOutOfRange(index));
        }
        if index + 1 < count {
            return Ok(self.piece_length);
        }

        let last = (self.total_length % self.piece_length as u64) as u32;
        if last == 0 {
            Ok(self.piece_length)
        } else {
            Ok(last)
        }
    }

    /// Absolute offset of the first byte of a piece in the torrent stream.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// The 20-byte SHA-1 digest published for a piece.
    pub fn piece_hash(&self, index: u32) -> Result<&[u8], PieceError> {
        if index >= self.piece_count() {
            return Err(PieceError::PieceOutOfRange(index));
        }
        let begin = index as usize * SHA1_HASH_SIZE;
        Ok(&self.pieces[begin..begin + SHA1_HASH_SIZE])
    }

    /// Number of blocks in a piece, `ceil(piece_len / BLOCK_SIZE)`.
    pub fn blocks_per_piece(&self, index: u32) -> Result<u32, PieceError> {
        Ok(self.piece_len(index)?.div_ceil(BLOCK_SIZE))
    }

    /// Length of a block; only the last block of a piece may be shorter.
    pub fn block_len(&self, index: u32, block: u32) -> Result<u32, PieceError> {
        let piece_len = self.piece_len(index)?;
        let begin = block
            .checked_mul(BLOCK_SIZE)
            .filter(|begin| *begin < piece_len)
            .ok_or(PieceError::BlockOutOfRange {
                index,
                begin: block.saturating_mul(BLOCK_SIZE),
            })?;
        Ok((piece_len - begin).min(BLOCK_SIZE))
    }

    /// Every block of a piece, in block order.
    pub fn blocks(&self, index: u32) -> Result<Vec<BlockAddress>, PieceError> {
        let nb_blocks = self.blocks_per_piece(index)?;
        (0..nb_blocks)
            .map(|block| {
                Ok(BlockAddress::new(
                    index,
                    block * BLOCK_SIZE,
                    self.block_len(index, block)?,
                ))
            })
            .collect()
    }

    /// Checks that an address names exactly one block of this torrent.
    pub fn validate_block(&self, block: &BlockAddress) -> Result<(), PieceError> {
        let out_of_range = PieceError::BlockOutOfRange {
            index: block.index,
            begin: block.begin,
        };
        if !block.begin.is_multiple_of(BLOCK_SIZE) {
            return Err(out_of_range);
        }
        if self.block_len(block.index, block.block_index())? != block.length {
            return Err(out_of_range);
        }
        Ok(())
    }
}

/// Flatten tracker tiers into a list of unique URLs, shuffling each tier as
/// per BEP 12. Falls back to the single `announce` key.
fn announce_urls(announce: &str, announce_list: Vec<Vec<String>>) -> Vec<String> {
    let mut urls: Vec<String> = vec![];
    let mut rng = rand::thread_rng();

    for mut tier in announce_list {
        tier.shuffle(&mut rng);
        for url in tier {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }

    if urls.is_empty() && !announce.is_empty() {
        urls.push(announce.to_owned());
    }

    urls
}
