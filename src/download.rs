//! # Download Orchestration
//!
//! Drives one torrent download from start to finish:
//!
//! 1. **Resume**: Restore saved progress and re-hash the pieces it claims
//! 2. **Announce**: Get peers from the torrent's trackers
//! 3. **Sessions**: Spawn one thread per peer, all sharing the piece tracker
//!    and the storage
//! 4. **Progress**: Follow session events until every session has ended
//! 5. **Report**: Summarize what was downloaded
//!
//! Peers that cannot be reached are tolerated; the download only fails
//! outright when no tracker returns a peer.

use crate::config::Config;
use crate::piece::PieceTracker;
use crate::session::*;
use crate::storage::Storage;
use crate::torrent::TorrentDescriptor;
use crate::tracker::*;

use anyhow::Result;
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use sha1::{Digest, Sha1};

use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;

/// Outcome of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// Share of blocks received, rounded
    pub percent_done: u8,
    /// Whether every piece was received and verified
    pub completed: bool,
    /// Sessions that ended without error
    pub peers_succeeded: usize,
    /// Sessions that gave up on their peer
    pub peers_failed: usize,
}

/// Download a torrent into a storage.
///
/// # Errors
///
/// Fails if no tracker returns a peer, or if saved progress cannot be checked
/// against the storage.
pub fn download(
    torrent: Arc<TorrentDescriptor>,
    config: Config,
    storage: Arc<dyn Storage>,
    announcer: &dyn Announcer,
) -> Result<DownloadReport> {
    println!(
        "Downloading {:?} ({} pieces)",
        torrent.name(),
        torrent.piece_count()
    );

    let tracker = Arc::new(PieceTracker::new(&torrent));
    let mut verified_bytes = 0;
    if config.resume {
        verified_bytes = restore_progress(&torrent, &tracker, storage.as_ref())?;
    }

    if tracker.is_done() {
        info!("Every piece is already downloaded");
        return Ok(DownloadReport {
            percent_done: 100,
            completed: true,
            peers_succeeded: 0,
            peers_failed: 0,
        });
    }

    // Request peers from trackers
    let mut status = ClientStatus::new(&torrent, config.port);
    status.left = torrent.total_length() - verified_bytes;
    let peers = request_peers(
        announcer,
        torrent.announce(),
        &status,
        config.announce_attempts,
    )?;
    info!("Starting sessions with {} peers", peers.len());

    let context = SessionContext {
        torrent: torrent.clone(),
        tracker: tracker.clone(),
        storage,
        config: Arc::new(config),
        peer_id: status.peer_id,
    };

    // Start one session per peer
    let (event_tx, event_rx) = unbounded();
    let mut handles = Vec::with_capacity(peers.len());
    for peer in peers {
        let session = PeerSession::new(peer, context.clone(), event_tx.clone());
        let handle = thread::Builder::new()
            .name(format!("peer-{}", peer.id))
            .spawn(move || session.run())?;
        handles.push(handle);
    }
    // Sessions hold the remaining senders, so the channel closes with the last one
    drop(event_tx);

    // Create progress bar
    let pb = ProgressBar::new(torrent.total_length());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );
    pb.set_position(verified_bytes);

    let mut streams: Vec<TcpStream> = vec![];
    let mut peers_succeeded = 0;
    let mut peers_failed = 0;

    for event in event_rx.iter() {
        match event {
            SessionEvent::Connected { peer, stream } => {
                debug!("Session with peer #{} connected", peer);
                if tracker.is_done() {
                    close_stream(&stream);
                } else {
                    streams.push(stream);
                }
            }
            SessionEvent::PieceVerified {
                peer,
                index,
                percent_done,
            } => {
                debug!(
                    "Piece {} verified by peer #{} ({}%)",
                    index, peer, percent_done
                );
                pb.inc(torrent.piece_len(index)? as u64);

                if tracker.is_done() {
                    // Wake sessions blocked on a read
                    streams.drain(..).for_each(|stream| close_stream(&stream));
                }
            }
            SessionEvent::PieceCorrupted { peer, index } => {
                debug!("Piece {} from peer #{} was corrupted", index, peer);
            }
            SessionEvent::Closed { peer, result } => match result {
                Ok(()) => peers_succeeded += 1,
                Err(e) => {
                    debug!("Peer #{} gave up: {}", peer, e);
                    peers_failed += 1;
                }
            },
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            error!("Error: a peer session panicked");
            peers_failed += 1;
        }
    }

    let completed = tracker.is_done();
    if completed {
        pb.finish();
    } else {
        pb.abandon();
    }

    Ok(DownloadReport {
        percent_done: tracker.percent_done(),
        completed,
        peers_succeeded,
        peers_failed,
    })
}

fn close_stream(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        trace!("Could not close peer stream: {}", e);
    }
}

/// Load saved progress into the tracker and re-hash every piece it marks as
/// complete. Pieces whose data no longer matches are downloaded again.
///
/// Returns the number of bytes in verified pieces.
fn restore_progress(
    torrent: &TorrentDescriptor,
    tracker: &PieceTracker,
    storage: &dyn Storage,
) -> Result<u64> {
    let received = match storage.load_progress() {
        Ok(Some(received)) => received,
        Ok(None) => return Ok(0),
        Err(e) => {
            warn!("Ignoring saved progress: {}", e);
            return Ok(0);
        }
    };
    if let Err(e) = tracker.restore(received) {
        warn!("Ignoring saved progress: {}", e);
        return Ok(0);
    }

    let mut verified_bytes = 0;
    for index in 0..torrent.piece_count() {
        if !tracker.piece_is_done(index)? {
            continue;
        }

        let length = torrent.piece_len(index)?;
        let piece = storage.read_block(torrent.piece_offset(index), length as usize)?;
        if Sha1::digest(&piece).as_slice() == torrent.piece_hash(index)? {
            verified_bytes += length as u64;
        } else {
            warn!("Saved piece {} is corrupted, downloading it again", index);
            tracker.reset(index)?;
        }
    }

    info!(
        "Resuming download at {}% ({} bytes verified)",
        tracker.percent_done(),
        verified_bytes
    );

    Ok(verified_bytes)
}
