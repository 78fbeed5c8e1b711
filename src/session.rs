//! # Peer Session
//!
//! A peer session downloads from one remote peer. Each session runs on its own
//! thread and shares the piece tracker and the storage with every other
//! session of the download.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting -> Handshaking -> Streaming -> Closed
//!     ^                            |
//!     +------- Reconnecting <------+
//! ```
//!
//! 1. **Connecting**: TCP connection with a deadline, retried a few times
//! 2. **Handshaking**: Exchange handshakes, retried with a fresh connection
//! 3. **Streaming**: Read the byte stream, cut it into frames and handle each
//!    frame in arrival order
//! 4. **Reconnecting**: Too many read timeouts in a row while the download is
//!    not complete
//!
//! ## Requests
//!
//! Blocks of the pieces the peer announces are queued per session. While the
//! peer does not choke us, the request pump claims queued blocks in the shared
//! tracker and sends REQUEST messages, keeping at most `pipeline_depth`
//! requests in flight.
//!
//! ## Piece Verification
//!
//! Blocks are written to storage as soon as they arrive, before they count as
//! received. The session whose block completes a piece reads the whole piece
//! back from storage and hashes it, whichever sessions delivered its blocks.
//! A corrupted piece is reset and downloaded again.

use crate::client::*;
use crate::config::Config;
use crate::error::{DecodeError, SessionError};
use crate::frame::FrameBuffer;
use crate::handshake::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;
use crate::queue::RequestQueue;
use crate::storage::Storage;
use crate::torrent::TorrentDescriptor;

use crossbeam_channel::Sender;
use sha1::{Digest, Sha1};

use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

/// Where a session stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Streaming,
    Reconnecting,
    Closed,
}

/// Progress reported by sessions to the download orchestrator.
#[derive(Debug)]
pub enum SessionEvent {
    /// A connection was established; the stream handle lets the orchestrator
    /// close it once the download is complete.
    Connected { peer: PeerId, stream: TcpStream },
    /// A piece matched its hash.
    PieceVerified {
        peer: PeerId,
        index: u32,
        percent_done: u8,
    },
    /// A piece failed its hash check and will be downloaded again.
    PieceCorrupted { peer: PeerId, index: u32 },
    /// The session ended.
    Closed {
        peer: PeerId,
        result: Result<(), SessionError>,
    },
}

/// Everything a session shares with the other sessions of a download.
#[derive(Clone)]
pub struct SessionContext {
    pub torrent: Arc<TorrentDescriptor>,
    pub tracker: Arc<PieceTracker>,
    pub storage: Arc<dyn Storage>,
    pub config: Arc<Config>,
    /// Our 20-byte peer id
    pub peer_id: [u8; 20],
}

enum Flow {
    Continue,
    Done,
}

enum Exit {
    Done,
    Reconnect,
}

/// Downloads from a single BitTorrent peer.
pub struct PeerSession {
    peer: Peer,
    torrent: Arc<TorrentDescriptor>,
    tracker: Arc<PieceTracker>,
    storage: Arc<dyn Storage>,
    config: Arc<Config>,
    peer_id: [u8; 20],
    events: Sender<SessionEvent>,
    state: SessionState,
    queue: RequestQueue,
    frames: FrameBuffer,
    /// Pieces the peer announced
    have: Vec<bool>,
    in_flight: usize,
    reconnects: u32,
}

impl PeerSession {
    pub fn new(peer: Peer, context: SessionContext, events: Sender<SessionEvent>) -> PeerSession {
        let piece_count = context.torrent.piece_count() as usize;
        PeerSession {
            peer,
            queue: RequestQueue::new(context.torrent.clone()),
            torrent: context.torrent,
            tracker: context.tracker,
            storage: context.storage,
            config: context.config,
            peer_id: context.peer_id,
            events,
            state: SessionState::Connecting,
            frames: FrameBuffer::new(),
            have: vec![false; piece_count],
            in_flight: 0,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until the download completes or the peer is given up,
    /// then report the outcome.
    pub fn run(mut self) {
        let result = match self.drive() {
            // Connections are torn down once another session completes
            Err(_) if self.tracker.is_done() => Ok(()),
            result => result,
        };
        self.state = SessionState::Closed;

        match &result {
            Ok(()) => info!("Session with peer {} finished", self.peer),
            Err(e) => warn!("Session with peer {} closed: {}", self.peer, e),
        }
        self.report(SessionEvent::Closed {
            peer: self.peer.id,
            result,
        });
    }

    fn report(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Download no longer listens to peer {}", self.peer);
        }
    }

    fn drive(&mut self) -> Result<(), SessionError> {
        let mut client = match self.connect()? {
            Some(client) => client,
            None => return Ok(()),
        };

        loop {
            self.handshake(&mut client)?;
            self.state = SessionState::Streaming;
            let exit = self.stream(&mut client);
            client.shutdown();

            match exit? {
                Exit::Done => return Ok(()),
                Exit::Reconnect => {
                    self.reconnects += 1;
                    if self.reconnects > self.config.reconnect_attempts {
                        return Err(SessionError::TimeoutBudget(self.config.timeout_budget));
                    }
                    self.state = SessionState::Reconnecting;
                    info!(
                        "Peer {} went silent, reconnecting ({}/{})",
                        self.peer, self.reconnects, self.config.reconnect_attempts
                    );
                    client = match self.connect()? {
                        Some(client) => client,
                        None => return Ok(()),
                    };
                }
            }
        }
    }

    /// Connect to the peer. Returns `None` if the download completed first.
    fn connect(&mut self) -> Result<Option<Client>, SessionError> {
        self.state = SessionState::Connecting;
        let attempts = self.config.connect_attempts;

        for attempt in 1..=attempts {
            if self.tracker.is_done() {
                return Ok(None);
            }
            match Client::connect(self.peer, self.config.connect_timeout, self.config.read_timeout)
            {
                Ok(client) => {
                    self.reset_connection(&client);
                    return Ok(Some(client));
                }
                Err(e) => debug!(
                    "Connection to peer {} failed (attempt {}/{}): {}",
                    self.peer, attempt, attempts, e
                ),
            }
        }

        Err(SessionError::Connect(attempts))
    }

    /// Per-connection state starts over on every new connection.
    fn reset_connection(&mut self, client: &Client) {
        self.frames = FrameBuffer::new();
        self.queue.clear();
        self.queue.set_choked(true);
        self.in_flight = 0;

        match client.stream_handle() {
            Ok(stream) => self.report(SessionEvent::Connected {
                peer: self.peer.id,
                stream,
            }),
            Err(e) => debug!("Could not clone stream of peer {}: {}", self.peer, e),
        }
    }

    fn handshake(&mut self, client: &mut Client) -> Result<(), SessionError> {
        self.state = SessionState::Handshaking;
        let attempts = self.config.handshake_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.exchange_handshake(client) {
                Ok(()) => {
                    debug!("Successfully connected to peer {}", self.peer);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    debug!(
                        "Handshake failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, attempts, self.config.retry_delay, e
                    );
                    thread::sleep(self.config.retry_delay);

                    if let Err(e) =
                        client.reconnect(self.config.connect_timeout, self.config.read_timeout)
                    {
                        debug!("Reconnection failed: {}", e);
                    }
                    self.reset_connection(client);
                    attempt += 1;
                }
                Err(e) => {
                    debug!(
                        "Max handshake retries ({}) exceeded for peer {}, giving up",
                        attempts, self.peer
                    );
                    return Err(match e {
                        SessionError::Handshake(_) => e,
                        other => SessionError::Handshake(other.to_string()),
                    });
                }
            }
        }
    }

    /// Send our handshake and handle the reply as the first frame.
    fn exchange_handshake(&mut self, client: &mut Client) -> Result<(), SessionError> {
        client.send_handshake(self.torrent.info_hash(), &self.peer_id)?;

        let frame = loop {
            if let Some(frame) = self.frames.next_frame()? {
                break frame;
            }
            client.read_chunk().map(|bytes| self.frames.extend(bytes))?;
        };
        if !is_handshake(&frame) {
            return Err(DecodeError::InvalidHandshake.into());
        }

        self.dispatch(client, &frame)?;
        Ok(())
    }

    /// Read loop of an established connection.
    fn stream(&mut self, client: &mut Client) -> Result<Exit, SessionError> {
        let mut timeouts = 0;

        loop {
            while let Some(frame) = self.frames.next_frame()? {
                if let Flow::Done = self.dispatch(client, &frame)? {
                    return Ok(Exit::Done);
                }
            }

            match client.read_chunk().map(|bytes| self.frames.extend(bytes)) {
                Ok(()) => timeouts = 0,
                Err(e) if e.is_timeout() => {
                    if self.tracker.is_done() {
                        return Ok(Exit::Done);
                    }
                    timeouts += 1;
                    if timeouts > self.config.timeout_budget {
                        return Ok(Exit::Reconnect);
                    }
                    debug!(
                        "Peer {} timed out ({}/{})",
                        self.peer, timeouts, self.config.timeout_budget
                    );
                    self.pump(client)?;
                }
                Err(_) if self.tracker.is_done() => return Ok(Exit::Done),
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&mut self, client: &mut Client, frame: &[u8]) -> Result<Flow, SessionError> {
        let message = if is_handshake(frame) {
            Message::Handshake(deserialize_handshake(frame)?)
        } else {
            decode_message(frame)?.message
        };

        match message {
            Message::Handshake(handshake) => self.on_handshake(client, &handshake)?,
            Message::Choke => return self.on_choke(client),
            Message::Unchoke => self.on_unchoke(client)?,
            Message::Have(index) => self.on_have(client, index)?,
            Message::Bitfield(bitfield) => self.on_bitfield(client, &bitfield)?,
            Message::Piece { index, begin, data } => {
                return self.on_piece(client, index, begin, data)
            }
            Message::KeepAlive => trace!("Receive KEEP_ALIVE from peer {}", self.peer),
            other => trace!("Ignore message {:?} from peer {}", other.id(), self.peer),
        }

        Ok(Flow::Continue)
    }

    fn on_handshake(&mut self, client: &mut Client, handshake: &Handshake) -> Result<(), SessionError> {
        debug!("Receive HANDSHAKE from peer {}", self.peer);
        if handshake.info_hash != *self.torrent.info_hash() {
            return Err(SessionError::Handshake("info hash mismatch".to_string()));
        }
        client.send_interested()
    }

    fn on_choke(&mut self, client: &mut Client) -> Result<Flow, SessionError> {
        debug!("Receive MESSAGE_CHOKE from peer {}", self.peer);
        if self.tracker.is_done() {
            return Ok(Flow::Done);
        }

        // A choking peer discards our pending requests
        self.queue.set_choked(true);
        self.in_flight = 0;
        client.send_handshake(self.torrent.info_hash(), &self.peer_id)?;

        Ok(Flow::Continue)
    }

    fn on_unchoke(&mut self, client: &mut Client) -> Result<(), SessionError> {
        debug!("Receive MESSAGE_UNCHOKE from peer {}", self.peer);
        self.queue.set_choked(false);

        if self.queue.is_empty() && self.in_flight == 0 {
            self.refill()?;
        }
        if self.queue.is_empty() {
            client.send_interested()
        } else {
            self.pump(client)
        }
    }

    fn on_have(&mut self, client: &mut Client, index: u32) -> Result<(), SessionError> {
        trace!("Receive MESSAGE_HAVE {} from peer {}", index, self.peer);
        let was_empty = self.queue.is_empty();

        self.queue.enqueue(index)?;
        self.have[index as usize] = true;

        if was_empty {
            self.pump(client)?;
        }
        Ok(())
    }

    fn on_bitfield(&mut self, client: &mut Client, bitfield: &[u8]) -> Result<(), SessionError> {
        debug!("Receive MESSAGE_BITFIELD from peer {}", self.peer);
        let was_empty = self.queue.is_empty();
        let piece_count = self.torrent.piece_count();

        for index in bitfield_pieces(bitfield).take_while(|index| *index < piece_count) {
            self.queue.enqueue(index)?;
            self.have[index as usize] = true;
        }

        if was_empty {
            self.pump(client)?;
        }
        Ok(())
    }

    /// Send requests for queued blocks until the pipeline is full.
    ///
    /// Blocks another session already requested are dropped from the queue.
    /// When the queue and the pipeline are both empty, the queue is refilled
    /// from the pieces the peer announced.
    fn pump(&mut self, client: &mut Client) -> Result<(), SessionError> {
        if self.queue.is_choked() {
            return Ok(());
        }
        if self.queue.is_empty() && self.in_flight == 0 {
            self.refill()?;
        }

        while !self.queue.is_choked()
            && !self.queue.is_empty()
            && self.in_flight < self.config.pipeline_depth
        {
            let block = self.queue.dequeue()?;
            if !self.tracker.claim(&block)? {
                continue;
            }

            if let Err(e) = client.send_request(&block) {
                self.queue.enqueue(block.index)?;
                return Err(e);
            }
            self.in_flight += 1;
        }

        Ok(())
    }

    /// Queue again every incomplete piece the peer has.
    fn refill(&mut self) -> Result<(), SessionError> {
        let incomplete: Vec<u32> = {
            let tracker = self.tracker.lock();
            (0..self.have.len() as u32)
                .filter(|index| !tracker.piece_is_done(*index).unwrap_or(true))
                .collect()
        };

        for index in incomplete {
            if self.have[index as usize] {
                self.queue.enqueue(index)?;
            }
        }
        Ok(())
    }

    fn on_piece(
        &mut self,
        client: &mut Client,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<Flow, SessionError> {
        let block = BlockAddress::new(index, begin, data.len() as u32);
        trace!("Receive MESSAGE_PIECE {} from peer {}", block, self.peer);
        self.torrent.validate_block(&block)?;

        // Bytes are on storage before the block counts as received
        let offset = self.torrent.piece_offset(index) + begin as u64;
        self.storage.write_block(offset, &data)?;
        let completed = self.tracker.record_received(&block)?;
        self.in_flight = self.in_flight.saturating_sub(1);

        if completed {
            self.complete_piece(index)?;
            if self.tracker.is_done() {
                info!("Download complete, closing peer {}", self.peer);
                self.storage.flush()?;
                client.shutdown();
                return Ok(Flow::Done);
            }
        }

        self.pump(client)?;
        Ok(Flow::Continue)
    }

    /// Piece bytes as stored, which every session writes to before marking
    /// a block received.
    fn read_piece(&self, index: u32) -> Result<Vec<u8>, SessionError> {
        let length = self.torrent.piece_len(index)? as usize;
        Ok(self
            .storage
            .read_block(self.torrent.piece_offset(index), length)?)
    }

    fn complete_piece(&mut self, index: u32) -> Result<(), SessionError> {
        let piece = self.read_piece(index)?;
        let hash = Sha1::digest(&piece);

        if hash.as_slice() != self.torrent.piece_hash(index)? {
            warn!(
                "Piece {} from peer {} failed its hash check, downloading it again",
                index, self.peer
            );
            self.tracker.reset(index)?;
            self.queue.enqueue(index)?;
            self.report(SessionEvent::PieceCorrupted {
                peer: self.peer.id,
                index,
            });
            return Ok(());
        }

        let percent_done = self.tracker.percent_done();
        info!(
            "Successfully verified piece {} from peer {} ({}%)",
            index, self.peer, percent_done
        );
        self.report(SessionEvent::PieceVerified {
            peer: self.peer.id,
            index,
            percent_done,
        });

        if self.config.resume {
            let storage = &self.storage;
            if let Err(e) = self
                .tracker
                .save_progress(|received| storage.persist_progress(received))
            {
                warn!("Could not save download progress: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::torrent::tests::descriptor_for;

    use crossbeam_channel::{unbounded, Receiver};
    use std::io::{self, Read, Write};
    use std::net::{Ipv4Addr, TcpListener};
    use std::time::Duration;

    pub(crate) const PIECE_LENGTH: u32 = 2 * BLOCK_SIZE;

    pub(crate) fn content() -> Vec<u8> {
        (0..2 * PIECE_LENGTH as usize + 20_000)
            .map(|i| (i * 31 % 251) as u8)
            .collect()
    }

    pub(crate) fn config() -> Config {
        Config {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(10),
            ..Config::default()
        }
    }

    struct Fixture {
        context: SessionContext,
        storage: Arc<MemoryStorage>,
        events: Receiver<SessionEvent>,
        sender: Sender<SessionEvent>,
    }

    fn fixture(content: &[u8], config: Config) -> Fixture {
        let torrent = Arc::new(descriptor_for(content, PIECE_LENGTH));
        let storage = Arc::new(MemoryStorage::new(content.len()));
        let (sender, events) = unbounded();
        Fixture {
            context: SessionContext {
                tracker: Arc::new(PieceTracker::new(&torrent)),
                torrent,
                storage: storage.clone(),
                config: Arc::new(config),
                peer_id: *b"-LE0001-testtesttest",
            },
            storage,
            events,
            sender,
        }
    }

    pub(crate) fn listener() -> (TcpListener, Peer) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Peer::new(0, Ipv4Addr::LOCALHOST, port))
    }

    fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
        let mut frame = vec![0; 4];
        stream.read_exact(&mut frame)?;
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        frame.resize(4 + len, 0);
        stream.read_exact(&mut frame[4..])?;
        Ok(frame)
    }

    /// Accept one connection, answer the handshake and expect INTERESTED.
    fn accept_leecher(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().unwrap();
        let mut handshake = [0; HANDSHAKE_LEN];
        stream.read_exact(&mut handshake).unwrap();
        assert!(is_handshake(&handshake));
        stream.write_all(&encode_handshake(&[7; 20], &[9; 20])).unwrap();
        assert_eq!(read_frame(&mut stream).unwrap(), Message::Interested.serialize());
        stream
    }

    /// Serve every requested block, flipping a byte of the first block of
    /// `corrupt` the first time it is asked for.
    pub(crate) fn seed(listener: TcpListener, content: Vec<u8>, corrupt: Option<u32>) {
        let mut stream = accept_leecher(&listener);
        let nb_pieces = content.len().div_ceil(PIECE_LENGTH as usize);
        stream.write_all(&encode_bitfield(&vec![true; nb_pieces])).unwrap();
        stream.write_all(&Message::Unchoke.serialize()).unwrap();

        let mut corrupt = corrupt;
        while let Ok(frame) = read_frame(&mut stream) {
            let Ok(DecodedMessage {
                message: Message::Request(block),
                ..
            }) = decode_message(&frame)
            else {
                continue;
            };

            let start = (block.index * PIECE_LENGTH + block.begin) as usize;
            let mut data = content[start..start + block.length as usize].to_vec();
            if corrupt == Some(block.index) && block.begin == 0 {
                data[0] ^= 0xff;
                corrupt = None;
            }
            if stream
                .write_all(&encode_piece(block.index, block.begin, &data))
                .is_err()
            {
                break;
            }
        }
    }

    fn drain(events: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn unchoke_sends_exactly_one_request() {
        let content = content();
        let fixture = fixture(&content, config());
        let (listener, peer) = listener();
        let session = PeerSession::new(peer, fixture.context.clone(), fixture.sender.clone());
        let handle = thread::spawn(move || session.run());

        let mut stream = accept_leecher(&listener);
        stream.write_all(&encode_bitfield(&[true, true, true])).unwrap();
        stream.write_all(&Message::Unchoke.serialize()).unwrap();

        let request = read_frame(&mut stream).unwrap();
        assert_eq!(
            decode_message(&request).unwrap().message,
            Message::Request(BlockAddress::new(0, 0, BLOCK_SIZE))
        );

        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut extra = [0; 1];
        let err = stream.read(&mut extra).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));

        drop(stream);
        handle.join().unwrap();
        let closed = drain(&fixture.events).into_iter().last().unwrap();
        assert!(matches!(
            closed,
            SessionEvent::Closed {
                result: Err(SessionError::StreamClosed),
                ..
            }
        ));
    }

    #[test]
    fn downloads_from_a_seeder() {
        let content = content();
        let fixture = fixture(
            &content,
            Config {
                pipeline_depth: 3,
                ..config()
            },
        );
        let (listener, peer) = listener();
        let seeder_content = content.clone();
        let seeder = thread::spawn(move || seed(listener, seeder_content, None));

        PeerSession::new(peer, fixture.context.clone(), fixture.sender.clone()).run();
        seeder.join().unwrap();

        assert!(fixture.context.tracker.is_done());
        assert_eq!(*fixture.storage.data.lock().unwrap(), content);

        let events = drain(&fixture.events);
        let verified: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::PieceVerified { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(verified, vec![0, 1, 2]);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Closed { result: Ok(()), .. })
        ));

        let progress = fixture.storage.progress.lock().unwrap().clone().unwrap();
        assert!(progress.iter().flatten().all(|received| *received));
    }

    #[test]
    fn corrupted_piece_is_downloaded_again() {
        let content = content();
        let fixture = fixture(&content, config());
        let (listener, peer) = listener();
        let seeder_content = content.clone();
        let seeder = thread::spawn(move || seed(listener, seeder_content, Some(1)));

        PeerSession::new(peer, fixture.context.clone(), fixture.sender.clone()).run();
        seeder.join().unwrap();

        assert!(fixture.context.tracker.is_done());
        assert_eq!(*fixture.storage.data.lock().unwrap(), content);

        let events = drain(&fixture.events);
        let corrupted: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::PieceCorrupted { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(corrupted, vec![1]);
    }

    /// A session with a live connection that never reads from the peer side.
    fn idle_session(fixture: &Fixture) -> (PeerSession, Client, TcpStream) {
        let (listener, peer) = listener();
        let timeout = Duration::from_secs(5);
        let client = Client::connect(peer, timeout, timeout).unwrap();
        let (remote, _) = listener.accept().unwrap();
        let session = PeerSession::new(peer, fixture.context.clone(), fixture.sender.clone());
        (session, client, remote)
    }

    fn block_data(content: &[u8], block: &BlockAddress) -> Vec<u8> {
        let start = (block.index * PIECE_LENGTH + block.begin) as usize;
        content[start..start + block.length as usize].to_vec()
    }

    #[test]
    fn piece_completes_only_when_all_blocks_arrive() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut session, mut client, _remote) = idle_session(&fixture);
        let blocks = fixture.context.torrent.blocks(0).unwrap();

        session
            .on_piece(&mut client, 0, blocks[1].begin, block_data(&content, &blocks[1]))
            .unwrap();
        assert!(!fixture.context.tracker.piece_is_done(0).unwrap());
        assert!(drain(&fixture.events).is_empty());

        session
            .on_piece(&mut client, 0, blocks[0].begin, block_data(&content, &blocks[0]))
            .unwrap();
        assert!(fixture.context.tracker.piece_is_done(0).unwrap());
        assert!(matches!(
            drain(&fixture.events).as_slice(),
            [SessionEvent::PieceVerified { index: 0, .. }]
        ));
        assert_eq!(
            fixture.storage.data.lock().unwrap()[..PIECE_LENGTH as usize],
            content[..PIECE_LENGTH as usize]
        );
    }

    #[test]
    fn blocks_from_other_sessions_are_read_back() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut first, mut first_client, _r1) = idle_session(&fixture);
        let (mut second, mut second_client, _r2) = idle_session(&fixture);
        let blocks = fixture.context.torrent.blocks(2).unwrap();

        first
            .on_piece(&mut first_client, 2, blocks[0].begin, block_data(&content, &blocks[0]))
            .unwrap();
        second
            .on_piece(&mut second_client, 2, blocks[1].begin, block_data(&content, &blocks[1]))
            .unwrap();

        assert!(matches!(
            drain(&fixture.events).as_slice(),
            [SessionEvent::PieceVerified { index: 2, .. }]
        ));
    }

    #[test]
    fn piece_downloaded_again_is_hashed_from_storage() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut first, mut first_client, _r1) = idle_session(&fixture);
        let (mut second, mut second_client, _r2) = idle_session(&fixture);
        let blocks = fixture.context.torrent.blocks(0).unwrap();

        let mut corrupt = block_data(&content, &blocks[0]);
        corrupt[0] ^= 0xff;
        first
            .on_piece(&mut first_client, 0, blocks[0].begin, corrupt)
            .unwrap();
        second
            .on_piece(&mut second_client, 0, blocks[1].begin, block_data(&content, &blocks[1]))
            .unwrap();
        assert!(!fixture.context.tracker.piece_is_done(0).unwrap());

        // After the reset each session delivers the block the other one had
        second
            .on_piece(&mut second_client, 0, blocks[0].begin, block_data(&content, &blocks[0]))
            .unwrap();
        first
            .on_piece(&mut first_client, 0, blocks[1].begin, block_data(&content, &blocks[1]))
            .unwrap();

        assert!(fixture.context.tracker.piece_is_done(0).unwrap());
        assert!(matches!(
            drain(&fixture.events).as_slice(),
            [
                SessionEvent::PieceCorrupted { index: 0, .. },
                SessionEvent::PieceVerified { index: 0, .. }
            ]
        ));
    }

    #[test]
    fn hash_mismatch_resets_and_requeues() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut session, mut client, _remote) = idle_session(&fixture);
        let blocks = fixture.context.torrent.blocks(1).unwrap();

        for block in &blocks {
            let mut data = block_data(&content, block);
            data[10] = data[10].wrapping_add(1);
            session.on_piece(&mut client, 1, block.begin, data).unwrap();
        }

        let tracker = fixture.context.tracker.lock();
        assert!(tracker.requested()[1].iter().all(|r| !r));
        assert!(tracker.received()[1].iter().all(|r| !r));
        drop(tracker);
        assert_eq!(session.queue.len(), blocks.len());
        assert_eq!(session.queue.peek().unwrap(), blocks[0]);
        assert!(matches!(
            drain(&fixture.events).as_slice(),
            [SessionEvent::PieceCorrupted { index: 1, .. }]
        ));
    }

    #[test]
    fn invalid_block_is_a_protocol_error() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut session, mut client, _remote) = idle_session(&fixture);

        let err = session
            .on_piece(&mut client, 0, 100, vec![0; 10])
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Protocol(_)));
        assert!(fixture.storage.data.lock().unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn have_pumps_only_into_an_empty_queue() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut session, mut client, mut remote) = idle_session(&fixture);
        session.queue.set_choked(false);

        session.on_have(&mut client, 1).unwrap();
        assert_eq!(session.in_flight, 1);
        assert_eq!(
            decode_message(&read_frame(&mut remote).unwrap()).unwrap().message,
            Message::Request(BlockAddress::new(1, 0, BLOCK_SIZE))
        );

        session.on_have(&mut client, 2).unwrap();
        assert_eq!(session.in_flight, 1);
        assert_eq!(session.queue.len(), 3);
    }

    #[test]
    fn choke_resends_handshake() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut session, mut client, mut remote) = idle_session(&fixture);
        session.queue.set_choked(false);
        session.in_flight = 1;

        assert!(matches!(session.on_choke(&mut client).unwrap(), Flow::Continue));
        assert!(session.queue.is_choked());
        assert_eq!(session.in_flight, 0);

        let mut handshake = [0; HANDSHAKE_LEN];
        remote.read_exact(&mut handshake).unwrap();
        assert_eq!(deserialize_handshake(&handshake).unwrap().info_hash, [7; 20]);
    }

    fn connections(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, SessionEvent::Connected { .. }))
            .count()
    }

    #[test]
    fn silent_peer_exhausts_reconnections() {
        let content = content();
        let fixture = fixture(
            &content,
            Config {
                read_timeout: Duration::from_millis(50),
                timeout_budget: 1,
                reconnect_attempts: 1,
                ..config()
            },
        );
        let (listener, peer) = listener();
        let silent = thread::spawn(move || {
            for _ in 0..2 {
                // Hold the connection open until the session drops it
                let mut stream = accept_leecher(&listener);
                let mut buf = [0; 64];
                while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
            }
        });

        PeerSession::new(peer, fixture.context.clone(), fixture.sender.clone()).run();
        silent.join().unwrap();

        let events = drain(&fixture.events);
        assert_eq!(connections(&events), 2);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Closed {
                result: Err(SessionError::TimeoutBudget(1)),
                ..
            })
        ));
    }

    #[test]
    fn foreign_handshake_is_retried_then_refused() {
        let content = content();
        let fixture = fixture(
            &content,
            Config {
                handshake_attempts: 2,
                ..config()
            },
        );
        let (listener, peer) = listener();
        let impostor = thread::spawn(move || {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().unwrap();
                let mut handshake = [0; HANDSHAKE_LEN];
                stream.read_exact(&mut handshake).unwrap();
                stream.write_all(&encode_handshake(&[8; 20], &[9; 20])).unwrap();
            }
        });

        let mut session = PeerSession::new(peer, fixture.context.clone(), fixture.sender.clone());
        let err = session.drive().unwrap_err();
        impostor.join().unwrap();

        assert!(matches!(&err, SessionError::Handshake(reason) if reason.contains("info hash")));
        assert_eq!(session.state(), SessionState::Handshaking);
        assert_eq!(connections(&drain(&fixture.events)), 2);
    }

    #[test]
    fn choke_after_completion_ends_the_session() {
        let content = content();
        let fixture = fixture(&content, config());
        let (mut session, mut client, mut remote) = idle_session(&fixture);
        let torrent = &fixture.context.torrent;
        for index in 0..torrent.piece_count() {
            for block in torrent.blocks(index).unwrap() {
                fixture.context.tracker.record_received(&block).unwrap();
            }
        }
        assert_eq!(session.state(), SessionState::Connecting);

        let flow = session
            .dispatch(&mut client, &Message::Choke.serialize())
            .unwrap();
        assert!(matches!(flow, Flow::Done));

        // No handshake goes out to a peer we are leaving
        remote
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut extra = [0; 1];
        assert!(remote.read(&mut extra).is_err());
    }

    #[test]
    fn unreachable_peer_fails_to_connect() {
        let content = content();
        let fixture = fixture(
            &content,
            Config {
                connect_attempts: 2,
                ..config()
            },
        );
        let (listener, peer) = listener();
        drop(listener);

        PeerSession::new(peer, fixture.context.clone(), fixture.sender.clone()).run();
        assert!(matches!(
            drain(&fixture.events).as_slice(),
            [SessionEvent::Closed {
                result: Err(SessionError::Connect(2)),
                ..
            }]
        ));
    }
}
