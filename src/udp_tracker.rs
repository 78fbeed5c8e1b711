//! # UDP Tracker Announce
//!
//! UDP trackers answer an announce in two round trips over a connectionless
//! socket. The connect step trades a transaction id for a connection id,
//! which the announce step then carries.
//!
//! ```text
//! connect:   protocol_id(8) action=0(4) transaction_id(4)
//!         -> action=0(4) transaction_id(4) connection_id(8)
//! announce:  connection_id(8) action=1(4) transaction_id(4) info_hash(20)
//!            peer_id(20) downloaded(8) left(8) uploaded(8) event(4) ip(4)
//!            key(4) num_want(4) port(2)
//!         -> action=1(4) transaction_id(4) interval(4) leechers(4)
//!            seeders(4) peers(6 * n)
//! ```
//!
//! Every integer is big endian. A tracker may answer either step with
//! `action=3` followed by an error message. Unanswered datagrams are sent
//! again, doubling the read deadline each time.

use crate::peer::*;
use crate::tracker::{Announcer, ClientStatus};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;
use url::Url;

use std::io::{self, Cursor};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

// Magic constant opening every connect request
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

// Event of the first announce of a download
const EVENT_STARTED: u32 = 2;

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const ANNOUNCE_RESPONSE_HEADER_LEN: usize = 20;
const MAX_DATAGRAM_LEN: usize = 2048;

/// UDP tracker client.
pub struct UdpAnnouncer {
    /// Read deadline of the first attempt
    timeout: Duration,
    /// Sends of each request before the tracker is given up
    attempts: u32,
}

impl UdpAnnouncer {
    pub fn new(timeout: Duration, attempts: u32) -> UdpAnnouncer {
        UdpAnnouncer {
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Send a request and wait for the datagram answering it.
    fn round_trip(&self, socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![0; MAX_DATAGRAM_LEN];
        let mut deadline = self.timeout;

        for attempt in 1..=self.attempts {
            socket.send(request)?;
            socket.set_read_timeout(Some(deadline))?;

            match socket.recv(&mut buf) {
                Ok(n) => return Ok(buf[..n].to_vec()),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    debug!(
                        "UDP tracker silent for {:?} (attempt {}/{})",
                        deadline, attempt, self.attempts
                    );
                    deadline *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(anyhow!(
            "UDP tracker did not answer after {} attempts",
            self.attempts
        ))
    }
}

impl Announcer for UdpAnnouncer {
    fn announce(&self, announce: &str, status: &ClientStatus) -> Result<Vec<Peer>> {
        let addr = tracker_addr(announce)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(addr)?;

        let mut rng = rand::thread_rng();

        let transaction_id = rng.gen();
        let response = self.round_trip(&socket, &build_connect_request(transaction_id))?;
        let connection_id = parse_connect_response(&response, transaction_id)?;
        debug!("Connected to UDP tracker {}", announce);

        let transaction_id = rng.gen();
        let request = build_announce_request(connection_id, transaction_id, rng.gen(), status);
        let response = self.round_trip(&socket, &request)?;

        parse_announce_response(&response, transaction_id)
    }
}

/// Resolve `udp://host:port[/path]` to an IPv4 socket address.
fn tracker_addr(announce: &str) -> Result<SocketAddr> {
    let url = match Url::parse(announce) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse tracker url {:?}", announce)),
    };
    if url.scheme() != "udp" {
        return Err(anyhow!("not a UDP tracker url: {:?}", announce));
    }

    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("tracker url {:?} has no host", announce))?;
    let port = url
        .port()
        .ok_or_else(|| anyhow!("tracker url {:?} has no port", announce))?;

    (host, port)
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| anyhow!("no IPv4 address for tracker {}", host))
}

pub fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut request = Vec::with_capacity(16);
    request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request
}

pub fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    status: &ClientStatus,
) -> Vec<u8> {
    let mut request = Vec::with_capacity(ANNOUNCE_REQUEST_LEN);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(&status.info_hash);
    request.extend_from_slice(&status.peer_id);
    request.extend_from_slice(&status.downloaded.to_be_bytes());
    request.extend_from_slice(&status.left.to_be_bytes());
    request.extend_from_slice(&status.uploaded.to_be_bytes());
    request.extend_from_slice(&EVENT_STARTED.to_be_bytes());
    // IP address, 0 lets the tracker use the sender's
    request.extend_from_slice(&0u32.to_be_bytes());
    request.extend_from_slice(&key.to_be_bytes());
    // Number of peers wanted, -1 for the tracker's default
    request.extend_from_slice(&(-1i32).to_be_bytes());
    request.extend_from_slice(&status.port.to_be_bytes());
    request
}

/// Check action and transaction id, returning a cursor past them.
fn read_header(
    buf: &[u8],
    action: u32,
    transaction_id: u32,
    min_len: usize,
) -> Result<Cursor<&[u8]>> {
    let mut cursor = Cursor::new(buf);
    let (got_action, got_transaction) =
        match (cursor.read_u32::<BigEndian>(), cursor.read_u32::<BigEndian>()) {
            (Ok(action), Ok(transaction)) => (action, transaction),
            _ => return Err(anyhow!("tracker response of {} bytes is too short", buf.len())),
        };

    if got_transaction != transaction_id {
        return Err(anyhow!(
            "tracker answered transaction {:#010x}, expected {:#010x}",
            got_transaction,
            transaction_id
        ));
    }
    if got_action == ACTION_ERROR {
        return Err(anyhow!(
            "tracker refused announce: {}",
            String::from_utf8_lossy(&buf[8..])
        ));
    }
    if got_action != action {
        return Err(anyhow!("tracker answered action {}, expected {}", got_action, action));
    }
    if buf.len() < min_len {
        return Err(anyhow!("tracker response of {} bytes is too short", buf.len()));
    }

    Ok(cursor)
}

/// Extract the connection id from a connect response.
pub fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64> {
    let mut cursor = read_header(buf, ACTION_CONNECT, transaction_id, CONNECT_RESPONSE_LEN)?;
    Ok(cursor.read_u64::<BigEndian>()?)
}

/// Extract the compact peer list from an announce response.
pub fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<Vec<Peer>> {
    let mut cursor = read_header(
        buf,
        ACTION_ANNOUNCE,
        transaction_id,
        ANNOUNCE_RESPONSE_HEADER_LEN,
    )?;
    let interval = cursor.read_u32::<BigEndian>()?;
    let leechers = cursor.read_u32::<BigEndian>()?;
    let seeders = cursor.read_u32::<BigEndian>()?;
    debug!(
        "UDP tracker knows {} seeders and {} leechers, re-announce every {}s",
        seeders, leechers, interval
    );

    build_peers(&buf[ANNOUNCE_RESPONSE_HEADER_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread;

    const CONNECTION_ID: u64 = 0x1122_3344_5566_7788;

    fn status() -> ClientStatus {
        ClientStatus {
            info_hash: [0xab; 20],
            peer_id: *b"-LE0001-abcdefghijkl",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
        }
    }

    fn transaction_of(request: &[u8]) -> u32 {
        u32::from_be_bytes([request[12], request[13], request[14], request[15]])
    }

    /// Answer one connect and one announce, returning both requests.
    /// The announce answer carries `transaction_offset` added to the
    /// transaction id of the request.
    fn fake_tracker(peers: Vec<u8>, transaction_offset: u32) -> (String, thread::JoinHandle<Vec<Vec<u8>>>) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let url = format!("udp://127.0.0.1:{}/announce", socket.local_addr().unwrap().port());

        let handle = thread::spawn(move || {
            let mut buf = [0; MAX_DATAGRAM_LEN];

            let (n, from) = socket.recv_from(&mut buf).unwrap();
            let connect = buf[..n].to_vec();
            let mut answer = ACTION_CONNECT.to_be_bytes().to_vec();
            answer.extend_from_slice(&connect[12..16]);
            answer.extend_from_slice(&CONNECTION_ID.to_be_bytes());
            socket.send_to(&answer, from).unwrap();

            let (n, from) = socket.recv_from(&mut buf).unwrap();
            let announce = buf[..n].to_vec();
            let transaction = transaction_of(&announce).wrapping_add(transaction_offset);
            let mut answer = ACTION_ANNOUNCE.to_be_bytes().to_vec();
            answer.extend_from_slice(&transaction.to_be_bytes());
            answer.extend_from_slice(&1800u32.to_be_bytes());
            answer.extend_from_slice(&3u32.to_be_bytes());
            answer.extend_from_slice(&1u32.to_be_bytes());
            answer.extend_from_slice(&peers);
            socket.send_to(&answer, from).unwrap();

            vec![connect, announce]
        });

        (url, handle)
    }

    #[test]
    fn announces_over_udp() {
        let (url, tracker) = fake_tracker(vec![127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80], 0);
        let announcer = UdpAnnouncer::new(Duration::from_secs(2), 2);

        let peers = announcer.announce(&url, &status()).unwrap();
        assert_eq!(
            peers,
            vec![
                Peer::new(0, Ipv4Addr::LOCALHOST, 6881),
                Peer::new(1, Ipv4Addr::new(10, 0, 0, 2), 80)
            ]
        );

        let requests = tracker.join().unwrap();
        let (connect, announce) = (&requests[0], &requests[1]);
        assert_eq!(connect.len(), 16);
        assert_eq!(connect[..8], PROTOCOL_ID.to_be_bytes());
        assert_eq!(announce.len(), ANNOUNCE_REQUEST_LEN);
        assert_eq!(announce[..8], CONNECTION_ID.to_be_bytes());
        assert_eq!(announce[16..36], [0xab; 20]);
        assert_eq!(&announce[36..56], b"-LE0001-abcdefghijkl");
        assert_eq!(announce[64..72], 1000u64.to_be_bytes());
        assert_eq!(announce[96..], 6881u16.to_be_bytes());
    }

    #[test]
    fn foreign_transaction_is_rejected() {
        let (url, tracker) = fake_tracker(vec![], 1);
        let announcer = UdpAnnouncer::new(Duration::from_secs(2), 1);

        let err = announcer.announce(&url, &status()).unwrap_err();
        assert!(err.to_string().contains("transaction"));
        tracker.join().unwrap();
    }

    #[test]
    fn silent_tracker_is_given_up() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let url = format!("udp://127.0.0.1:{}", socket.local_addr().unwrap().port());
        let announcer = UdpAnnouncer::new(Duration::from_millis(50), 2);

        let err = announcer.announce(&url, &status()).unwrap_err();
        assert!(err.to_string().contains("2 attempts"));

        // Both connect attempts reached the tracker
        let mut buf = [0; 64];
        socket.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(socket.recv(&mut buf).unwrap(), 16);
        assert_eq!(socket.recv(&mut buf).unwrap(), 16);
    }

    #[test]
    fn error_action_carries_the_message() {
        let mut buf = ACTION_ERROR.to_be_bytes().to_vec();
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(b"torrent not registered");

        let err = parse_announce_response(&buf, 7).unwrap_err();
        assert!(err.to_string().contains("torrent not registered"));
    }

    #[test]
    fn connect_response_yields_connection_id() {
        let mut buf = ACTION_CONNECT.to_be_bytes().to_vec();
        buf.extend_from_slice(&9u32.to_be_bytes());
        buf.extend_from_slice(&CONNECTION_ID.to_be_bytes());

        assert_eq!(parse_connect_response(&buf, 9).unwrap(), CONNECTION_ID);
        assert!(parse_connect_response(&buf[..12], 9).is_err());
        assert!(parse_connect_response(&buf, 8).is_err());
    }

    #[test]
    fn tracker_urls_need_a_port() {
        assert!(tracker_addr("udp://127.0.0.1:6969/announce").is_ok());
        assert!(tracker_addr("udp://127.0.0.1/announce").is_err());
        assert!(tracker_addr("http://127.0.0.1:80/announce").is_err());
    }
}
