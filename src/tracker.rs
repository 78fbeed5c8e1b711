//! # Tracker Announce
//!
//! Peers are discovered by announcing to the torrent's trackers. The core only
//! depends on the [`Announcer`] trait. [`HttpAnnouncer`] implements the HTTP
//! tracker protocol with compact peer lists, [`UdpAnnouncer`] the UDP one, and
//! [`TrackerClient`] picks between them by URL scheme.
//!
//! ## Announce Request
//!
//! ```text
//! <announce>?info_hash=..&peer_id=..&port=..&uploaded=0&downloaded=0&left=..&compact=1&event=started
//! ```
//!
//! `info_hash` and `peer_id` are raw 20-byte strings, percent-encoded byte by
//! byte.

use crate::peer::*;
use crate::torrent::TorrentDescriptor;
use crate::udp_tracker::UdpAnnouncer;

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::Deserialize;
use serde_bencode::{de, value::Value};
use url::Url;

use std::net::Ipv4Addr;
use std::time::Duration;

// Client prefix of generated peer ids, Azureus style
const PEER_ID_PREFIX: &[u8; 8] = b"-LE0001-";

/// What we tell trackers about ourselves.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    /// 20-byte SHA-1 hash of the info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte unique identifier for this client instance
    pub peer_id: [u8; 20],
    /// Port we would accept connections on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still to download
    pub left: u64,
}

impl ClientStatus {
    /// Status of a fresh download of a torrent, with a random peer id.
    pub fn new(torrent: &TorrentDescriptor, port: u16) -> ClientStatus {
        ClientStatus {
            info_hash: *torrent.info_hash(),
            peer_id: generate_peer_id(),
            port,
            uploaded: 0,
            downloaded: 0,
            left: torrent.total_length(),
        }
    }
}

/// Generate a peer id: client prefix followed by random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for x in peer_id[PEER_ID_PREFIX.len()..].iter_mut() {
        *x = rng.gen();
    }
    peer_id
}

/// Source of peers for a torrent.
pub trait Announcer: Send + Sync {
    /// Announce to one tracker URL and return the peers it knows.
    fn announce(&self, url: &str, status: &ClientStatus) -> Result<Vec<Peer>>;
}

/// BencodeTracker structure.
#[derive(Debug, Deserialize)]
struct BencodeTracker {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: Option<u32>,
    // Compact string or list of dictionaries
    #[serde(default)]
    peers: Option<Value>,
}

/// HTTP tracker client.
pub struct HttpAnnouncer {
    client: reqwest::blocking::Client,
}

impl HttpAnnouncer {
    pub fn new(timeout: Duration) -> Result<HttpAnnouncer> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpAnnouncer { client })
    }
}

impl Announcer for HttpAnnouncer {
    fn announce(&self, announce: &str, status: &ClientStatus) -> Result<Vec<Peer>> {
        let full_url = build_tracker_url(announce, status)?;

        let response = self.client.get(&full_url).send()?.error_for_status()?;
        let bytes = response.bytes()?;

        parse_tracker_response(&bytes)
    }
}

/// Announces over HTTP or UDP depending on the tracker URL scheme.
pub struct TrackerClient {
    http: HttpAnnouncer,
    udp: UdpAnnouncer,
}

impl TrackerClient {
    /// `udp_timeout` is the deadline of the first UDP attempt; retries double it.
    pub fn new(http_timeout: Duration, udp_timeout: Duration, udp_attempts: u32) -> Result<TrackerClient> {
        Ok(TrackerClient {
            http: HttpAnnouncer::new(http_timeout)?,
            udp: UdpAnnouncer::new(udp_timeout, udp_attempts),
        })
    }
}

impl Announcer for TrackerClient {
    fn announce(&self, url: &str, status: &ClientStatus) -> Result<Vec<Peer>> {
        if url.starts_with("udp://") {
            self.udp.announce(url, status)
        } else {
            self.http.announce(url, status)
        }
    }
}

/// Decode a bencoded announce response into peers.
pub fn parse_tracker_response(buf: &[u8]) -> Result<Vec<Peer>> {
    let tracker_bencode = match de::from_bytes::<BencodeTracker>(buf) {
        Ok(bencode) => bencode,
        Err(e) => return Err(anyhow!("could not decode tracker response: {}", e)),
    };

    if let Some(reason) = tracker_bencode.failure_reason {
        return Err(anyhow!("tracker refused announce: {}", reason));
    }
    if let Some(interval) = tracker_bencode.interval {
        debug!("Tracker asks to re-announce every {}s", interval);
    }

    match tracker_bencode.peers {
        Some(Value::Bytes(compact)) => build_peers(&compact),
        Some(Value::List(entries)) => Ok(entries
            .iter()
            .filter_map(dictionary_peer)
            .enumerate()
            .map(|(i, (ip, port))| Peer::new(i as PeerId, ip, port))
            .collect()),
        Some(_) => Err(anyhow!("tracker sent peers in an unknown format")),
        None => Ok(vec![]),
    }
}

/// Read one `{ip, port}` entry of a non-compact peer list. IPv6 and host
/// names are skipped.
fn dictionary_peer(entry: &Value) -> Option<(Ipv4Addr, u16)> {
    let Value::Dict(fields) = entry else {
        return None;
    };
    let ip = match fields.get(b"ip".as_slice())? {
        Value::Bytes(ip) => std::str::from_utf8(ip).ok()?.parse().ok()?,
        _ => return None,
    };
    let port = match fields.get(b"port".as_slice())? {
        Value::Int(port) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    Some((ip, port))
}

/// Each byte is encoded as %XX where XX is the hexadecimal representation.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}

/// Build tracker URL.
///
/// # Arguments
///
/// * `announce` - The tracker URL.
/// * `status` - Info hash, peer id, port and transfer counters to report.
///
pub fn build_tracker_url(announce: &str, status: &ClientStatus) -> Result<String> {
    let base_url = match Url::parse(announce) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse tracker url {:?}", announce)),
    };
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(anyhow!("unsupported tracker scheme {:?}", base_url.scheme()));
    }

    // Build query string manually to handle binary data properly
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event=started",
        percent_encode_binary(&status.info_hash),
        percent_encode_binary(&status.peer_id),
        status.port,
        status.uploaded,
        status.downloaded,
        status.left
    );

    let mut url = base_url.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

/// Request peers from trackers.
///
/// Tracker URLs are tried in order, cycling, for at most `attempts` announces.
/// The first announce returning peers wins.
///
/// # Errors
///
/// Fails if no announce yields a peer.
pub fn request_peers(
    announcer: &dyn Announcer,
    urls: &[String],
    status: &ClientStatus,
    attempts: u32,
) -> Result<Vec<Peer>> {
    if urls.is_empty() {
        return Err(anyhow!("no tracker URLs available"));
    }

    for (attempt, url) in urls.iter().cycle().take(attempts as usize).enumerate() {
        match announcer.announce(url, status) {
            Ok(peers) if !peers.is_empty() => {
                info!("Tracker {} returned {} peers", url, peers.len());
                return Ok(dedup_peers(peers));
            }
            Ok(_) => warn!("Tracker {} returned no peers", url),
            Err(e) => warn!(
                "Announce to {} failed (attempt {}/{}): {}",
                url,
                attempt + 1,
                attempts,
                e
            ),
        }
    }

    Err(anyhow!("could not get peers from any tracker"))
}
