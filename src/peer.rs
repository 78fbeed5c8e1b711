//! # BitTorrent Peer Information
//!
//! This module defines the `Peer` structure and parses peer lists received
//! from BitTorrent trackers.
//!
//! ## Compact Peer Format
//!
//! The compact format consists of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! - IP address in network byte order (big-endian)
//! - Port number in network byte order (big-endian)

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::collections::HashSet;
use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const PEER_SIZE: usize = 6;

pub type PeerId = u32;

/// Represents a BitTorrent peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    /// Identifier assigned to this peer for logging
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    pub fn new(id: PeerId, ip: Ipv4Addr, port: u16) -> Peer {
        Peer { id, ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({}:{})", self.id, self.ip, self.port)
    }
}

/// Parses a compact peer list from a tracker response.
///
/// # Errors
///
/// Returns an error if the peer list length is not a multiple of 6 bytes.
pub fn build_peers(tracker_peers: &[u8]) -> Result<Vec<Peer>> {
    // Check tracker peers are valid
    if !tracker_peers.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let mut peers = Vec::with_capacity(tracker_peers.len() / PEER_SIZE);
    for (i, chunk) in tracker_peers.chunks_exact(PEER_SIZE).enumerate() {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let mut port_cursor = Cursor::new(&chunk[4..6]);
        let port = port_cursor.read_u16::<BigEndian>()?;
        peers.push(Peer::new(i as PeerId, ip, port));
    }

    Ok(peers)
}

/// Deduplicate peers by address and assign sequential IDs.
pub fn dedup_peers(peers: Vec<Peer>) -> Vec<Peer> {
    let mut seen = HashSet::new();
    peers
        .into_iter()
        .filter(|peer| seen.insert((peer.ip, peer.port)))
        .enumerate()
        .map(|(i, peer)| Peer::new(i as PeerId, peer.ip, peer.port))
        .collect()
}
