//! # Leech
//!
//! A command-line BitTorrent download client.
//!
//! ## Usage
//!
//! ```bash
//! leech <torrent_file>
//! leech <torrent_file> -o <output_dir>
//! ```
//!
//! Logging is controlled with `RUST_LOG`, e.g. `RUST_LOG=leech=debug`.

#[macro_use]
extern crate log;

mod args;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use args::Args;
use clap::Parser;
use leech::download::download;
use leech::storage::{FileStorage, Storage};
use leech::torrent::TorrentDescriptor;
use leech::tracker::TrackerClient;

// Deadline for each HTTP tracker announce
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);
// Deadline of the first UDP tracker attempt, doubled on each retry
const UDP_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_ATTEMPTS: u32 = 2;

fn run(args: Args) -> Result<bool> {
    // Check if torrent file exists
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {:?}", args.torrent));
    }

    // Open torrent
    let torrent = Arc::new(TorrentDescriptor::from_file(&args.torrent)?);
    let config = args.config();

    // Open output files
    let storage = Arc::new(FileStorage::open(&torrent, &args.output)?);
    let announcer = TrackerClient::new(ANNOUNCE_TIMEOUT, UDP_TIMEOUT, UDP_ATTEMPTS)?;

    // Download torrent
    let report = download(torrent, config, storage.clone(), &announcer)?;
    info!(
        "{} peers succeeded, {} peers failed",
        report.peers_succeeded, report.peers_failed
    );

    if !report.completed {
        eprintln!("Download stopped at {}%.", report.percent_done);
        return Ok(false);
    }

    storage.flush()?;
    if let Err(e) = storage.clear_progress() {
        warn!("Could not remove resume file: {}", e);
    }
    for path in storage.paths() {
        println!("Saved in {:?}.", path);
    }

    Ok(true)
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    match run(args) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(2),
        Err(error) => {
            eprintln!("Error: {}", error);
            std::process::exit(1);
        }
    }
}
