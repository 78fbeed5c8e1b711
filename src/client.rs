//! # BitTorrent Peer Connection
//!
//! This module implements the transport side of the peer wire protocol: the
//! TCP connection to one remote peer and the messages we send on it.
//!
//! ## Protocol Overview
//!
//! The peer wire protocol operates over TCP and consists of:
//!
//! 1. **Handshake**: Initial protocol negotiation with peer identification
//! 2. **Bitfield / Have**: The peer announces which pieces it has
//! 3. **Choke/Unchoke Management**: Flow control for download rates
//! 4. **Piece Requests**: Requesting specific blocks of data
//! 5. **Piece Transfer**: Receiving blocks, verified later per piece
//!
//! ## Reading
//!
//! The connection only hands out raw chunks of the byte stream. Splitting the
//! stream into frames is the job of [`FrameBuffer`](crate::frame::FrameBuffer),
//! so a read may return half a message or several messages at once.
//!
//! ## Timeouts
//!
//! Every read and write runs under a deadline. An expired read deadline
//! surfaces as an I/O error for which
//! [`SessionError::is_timeout`](crate::error::SessionError::is_timeout) is true.

use crate::error::SessionError;
use crate::handshake::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::BlockAddress;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

// Size of the buffer used for each socket read
const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Represents a connection to a remote BitTorrent peer.
pub struct Client {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Scratch buffer for socket reads
    chunk: Vec<u8>,
}

impl Client {
    /// Establishes a TCP connection to a peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer information including IP address and port
    /// * `connect_timeout` - Deadline for the TCP connection
    /// * `io_timeout` - Deadline for every later read and write
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established within the
    /// timeout or the socket deadlines cannot be set.
    pub fn connect(
        peer: Peer,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Client, SessionError> {
        let conn = TcpStream::connect_timeout(&peer.socket_addr(), connect_timeout)?;

        info!("Connected to peer {}", peer);

        let client = Client {
            peer,
            conn,
            chunk: vec![0; READ_CHUNK_SIZE],
        };
        client.set_connection_timeout(io_timeout)?;

        Ok(client)
    }

    /// Sets read and write timeouts on the TCP connection.
    pub fn set_connection_timeout(&self, timeout: Duration) -> Result<(), SessionError> {
        self.conn.set_write_timeout(Some(timeout))?;
        self.conn.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Reads the next chunk of the byte stream.
    ///
    /// # Errors
    ///
    /// Returns `StreamClosed` when the peer closed the connection, and an I/O
    /// error when the read deadline expires or the socket fails.
    pub fn read_chunk(&mut self) -> Result<&[u8], SessionError> {
        let n = self.conn.read(&mut self.chunk)?;
        if n == 0 {
            return Err(SessionError::StreamClosed);
        }
        trace!("Read {} bytes from peer {}", n, self.peer);
        Ok(&self.chunk[..n])
    }

    fn send(&mut self, encoded: &[u8]) -> Result<(), SessionError> {
        self.conn.write_all(encoded)?;
        Ok(())
    }

    /// Sends our handshake: protocol string, reserved bytes, info hash and
    /// peer id.
    ///
    /// # Handshake Message Format
    ///
    /// ```text
    /// <pstrlen><pstr><reserved><info_hash><peer_id>
    /// ```
    pub fn send_handshake(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<(), SessionError> {
        debug!("Send HANDSHAKE to peer {}", self.peer);
        self.send(&encode_handshake(info_hash, peer_id))
    }

    /// Sends an INTERESTED message to the peer.
    ///
    /// Signals that we are interested in downloading pieces from this peer.
    /// Peers only unchoke interested clients.
    pub fn send_interested(&mut self) -> Result<(), SessionError> {
        debug!("Send MESSAGE_INTERESTED to peer {}", self.peer);
        self.send(&Message::Interested.serialize())
    }

    /// Sends a REQUEST message to ask the peer for a specific block of data.
    ///
    /// # Message Format
    ///
    /// ```text
    /// <len=0013><id=6><index: u32><begin: u32><length: u32>
    /// ```
    pub fn send_request(&mut self, block: &BlockAddress) -> Result<(), SessionError> {
        debug!("Send MESSAGE_REQUEST for {} to peer {}", block, self.peer);
        self.send(&Message::Request(*block).serialize())
    }

    /// Replaces the connection with a fresh one to the same peer.
    ///
    /// # Reconnection Process
    ///
    /// 1. Shutdown existing connection (both read/write)
    /// 2. Create new TCP connection to peer
    /// 3. Set read/write timeouts
    pub fn reconnect(
        &mut self,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<(), SessionError> {
        info!("Attempting to reconnect to peer {}", self.peer);

        self.shutdown();

        let conn = TcpStream::connect_timeout(&self.peer.socket_addr(), connect_timeout)?;
        self.conn = conn;
        self.set_connection_timeout(io_timeout)?;

        info!("Successfully reconnected to peer {}", self.peer);

        Ok(())
    }

    /// A second handle on the socket, used to close it from another thread.
    pub fn stream_handle(&self) -> Result<TcpStream, SessionError> {
        Ok(self.conn.try_clone()?)
    }

    /// Closes both directions of the connection.
    pub fn shutdown(&self) {
        if let Err(e) = self.conn.shutdown(Shutdown::Both) {
            debug!("Error shutting down connection to peer {}: {}", self.peer, e);
        }
    }
}
