//! # Download Storage
//!
//! A torrent is one contiguous byte stream split across its files. Peer
//! sessions write blocks at absolute stream offsets; the storage maps each
//! write onto the files it overlaps and performs positioned writes, so
//! sessions never share a file cursor.
//!
//! ## Layout
//!
//! - Single file torrents are written to `<output>/<name>`
//! - Multi file torrents are written to `<output>/<name>/<path...>`
//!
//! ## Resume State
//!
//! The received-block flags are saved to `<output>/.<name>.resume` as a
//! bencoded dictionary holding the info hash, the block count of every piece
//! and one packed bitfield per piece.

use crate::torrent::TorrentDescriptor;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Where downloaded blocks and progress go.
pub trait Storage: Send + Sync {
    /// Write bytes at an absolute offset of the torrent stream.
    fn write_block(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Read bytes back from an absolute offset of the torrent stream.
    fn read_block(&self, offset: u64, length: usize) -> io::Result<Vec<u8>>;

    /// Save the received-block flags.
    fn persist_progress(&self, received: &[Vec<bool>]) -> Result<()>;

    /// Load previously saved received-block flags, if any.
    fn load_progress(&self) -> Result<Option<Vec<Vec<bool>>>>;

    /// Flush written data to disk.
    fn flush(&self) -> io::Result<()>;
}

struct OpenFile {
    path: PathBuf,
    file: File,
    /// Offset of the first byte of this file in the torrent stream
    offset: u64,
    length: u64,
}

/// Files of a torrent on the local file system.
pub struct FileStorage {
    files: Vec<OpenFile>,
    resume_path: PathBuf,
    /// Held while the resume file is replaced
    resume_lock: Mutex<()>,
    info_hash: [u8; 20],
}

#[derive(Serialize, Deserialize)]
struct ResumeState {
    info_hash: ByteBuf,
    // Number of blocks of each piece
    lengths: Vec<u32>,
    // One packed bitfield per piece, MSB first
    pieces: Vec<ByteBuf>,
}

/// Sanitize a path segment to prevent path traversal.
fn sanitize_segment(segment: &str) -> Result<String> {
    let safe = segment.replace(['/', '\\'], "_");
    let mut components = Path::new(&safe).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(safe),
        _ => Err(anyhow!("unsafe path segment {:?} in torrent", segment)),
    }
}

/// Paths of every file of a torrent under an output directory.
pub fn file_paths(torrent: &TorrentDescriptor, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let name = sanitize_segment(torrent.name())?;
    if !torrent.is_multi_file() {
        return Ok(vec![output_dir.join(name)]);
    }

    let root = output_dir.join(name);
    torrent
        .files()
        .iter()
        .map(|entry| {
            let mut path = root.clone();
            for segment in &entry.path {
                path.push(sanitize_segment(segment)?);
            }
            Ok(path)
        })
        .collect()
}

impl FileStorage {
    /// Create or open every file of a torrent, sized to its final length.
    ///
    /// Existing files are kept so an interrupted download can resume.
    pub fn open(torrent: &TorrentDescriptor, output_dir: &Path) -> Result<FileStorage> {
        let paths = file_paths(torrent, output_dir)?;
        let mut files = Vec::with_capacity(paths.len());
        let mut offset = 0;

        for (path, entry) in paths.into_iter().zip(torrent.files()) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) => return Err(anyhow!("could not create output file {:?}: {}", path, e)),
            };
            if file.metadata()?.len() != entry.length {
                file.set_len(entry.length)?;
            }
            debug!("Opened {:?} at stream offset {}", path, offset);

            files.push(OpenFile {
                path,
                file,
                offset,
                length: entry.length,
            });
            offset += entry.length;
        }

        let resume_path = output_dir.join(format!(".{}.resume", sanitize_segment(torrent.name())?));

        Ok(FileStorage {
            files,
            resume_path,
            resume_lock: Mutex::new(()),
            info_hash: *torrent.info_hash(),
        })
    }

    /// Paths of the files, in stream order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    /// Remove the resume file once the download is complete.
    pub fn clear_progress(&self) -> Result<()> {
        match fs::remove_file(&self.resume_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Files overlapping `[offset, offset + length)`, with the overlap as
    /// `(file, offset in file, range in the buffer)`.
    fn spans(
        &self,
        offset: u64,
        length: usize,
    ) -> io::Result<Vec<(&OpenFile, u64, std::ops::Range<usize>)>> {
        let end = offset + length as u64;
        let total = self.files.last().map_or(0, |f| f.offset + f.length);
        if end > total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {}..{} beyond torrent length {}", offset, end, total),
            ));
        }

        Ok(self
            .files
            .iter()
            .filter(|f| f.offset < end && f.offset + f.length > offset)
            .map(|f| {
                let start = offset.max(f.offset);
                let stop = end.min(f.offset + f.length);
                let buf_range = (start - offset) as usize..(stop - offset) as usize;
                (f, start - f.offset, buf_range)
            })
            .collect())
    }
}

impl Storage for FileStorage {
    fn write_block(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        for (open, file_offset, range) in self.spans(offset, data.len())? {
            write_all_at(&open.file, &data[range], file_offset)?;
        }
        Ok(())
    }

    fn read_block(&self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let mut data = vec![0; length];
        for (open, file_offset, range) in self.spans(offset, length)? {
            read_exact_at(&open.file, &mut data[range], file_offset)?;
        }
        Ok(data)
    }

    fn persist_progress(&self, received: &[Vec<bool>]) -> Result<()> {
        let state = ResumeState {
            info_hash: ByteBuf::from(self.info_hash.to_vec()),
            lengths: received.iter().map(|row| row.len() as u32).collect(),
            pieces: received.iter().map(|row| ByteBuf::from(pack(row))).collect(),
        };
        let buf = ser::to_bytes(&state)?;

        // Write then rename so a crash never leaves a torn resume file
        let _guard = self.resume_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let tmp = self.resume_path.with_extension("resume.tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, &self.resume_path)?;

        Ok(())
    }

    fn load_progress(&self) -> Result<Option<Vec<Vec<bool>>>> {
        let buf = match fs::read(&self.resume_path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = match de::from_bytes::<ResumeState>(&buf) {
            Ok(state) => state,
            Err(e) => return Err(anyhow!("could not decode resume file: {}", e)),
        };
        if state.info_hash.as_slice() != self.info_hash {
            return Err(anyhow!("resume file belongs to another torrent"));
        }
        if state.lengths.len() != state.pieces.len() {
            return Err(anyhow!("resume file is corrupted"));
        }

        let received = state
            .lengths
            .iter()
            .zip(&state.pieces)
            .map(|(len, bits)| unpack(bits, *len as usize))
            .collect();

        Ok(Some(received))
    }

    fn flush(&self) -> io::Result<()> {
        for open in &self.files {
            open.file.sync_data()?;
        }
        Ok(())
    }
}

fn pack(flags: &[bool]) -> Vec<u8> {
    let mut bits = vec![0u8; flags.len().div_ceil(8)];
    for (i, set) in flags.iter().enumerate() {
        if *set {
            bits[i / 8] |= 1 << (7 - i % 8);
        }
    }
    bits
}

fn unpack(bits: &[u8], len: usize) -> Vec<bool> {
    (0..len)
        .map(|i| bits.get(i / 8).is_some_and(|byte| byte >> (7 - i % 8) & 1 != 0))
        .collect()
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let read = file.seek_read(buf, offset)?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[read..];
        offset += read as u64;
    }
    Ok(())
}
