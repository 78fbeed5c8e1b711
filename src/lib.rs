//! # Leech BitTorrent Client
//!
//! A BitTorrent download client speaking the peer wire protocol over TCP.
//!
//! ## Features
//!
//! - Single and multi file torrents
//! - Multitracker announce over HTTP and UDP with compact peer lists
//! - Multi-peer concurrent downloading, one thread per peer
//! - Block request pipelining with a configurable depth
//! - Piece verification with SHA-1 hashing
//! - Resumable downloads
//!
//! ## Architecture
//!
//! - [`download`]: announces, spawns peer sessions and follows their progress
//! - [`session`]: per-peer state machine driving the wire protocol
//! - [`piece`]: block tracking shared by every session
//! - [`queue`]: per-peer queue of blocks to request
//! - [`message`], [`handshake`], [`frame`]: wire codec and frame reassembly
//! - [`storage`], [`tracker`]: file system and tracker collaborators

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod queue;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod udp_tracker;
