//! # Download Configuration
//!
//! Timeouts, retry budgets and pipeline depth for one download. A `Config` is
//! built once (from command-line flags, or `Config::default()`) and handed to
//! the orchestrator, which shares it with every peer session.

use std::time::Duration;

// Default port for BitTorrent client connections
pub const DEFAULT_PORT: u16 = 6881;

/// Settings shared by every component of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Port reported to trackers
    pub port: u16,
    /// Deadline for establishing a TCP connection
    pub connect_timeout: Duration,
    /// Connection attempts before a peer is abandoned
    pub connect_attempts: u32,
    /// Handshake attempts before a peer is abandoned
    pub handshake_attempts: u32,
    /// Deadline for each socket read and write
    pub read_timeout: Duration,
    /// Consecutive read timeouts tolerated before reconnecting
    pub timeout_budget: u32,
    /// Reconnections after timeouts before a peer is abandoned
    pub reconnect_attempts: u32,
    /// Delay between handshake retries
    pub retry_delay: Duration,
    /// Block requests kept in flight per peer
    pub pipeline_depth: usize,
    /// Total announce attempts across all tracker URLs
    pub announce_attempts: u32,
    /// Restore and persist download progress
    pub resume: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 3,
            handshake_attempts: 3,
            read_timeout: Duration::from_secs(30),
            timeout_budget: 4,
            reconnect_attempts: 3,
            retry_delay: Duration::from_secs(5),
            pipeline_depth: 1,
            announce_attempts: 5,
            resume: true,
        }
    }
}
