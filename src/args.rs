//! # Command-Line Argument Parsing
//!
//! This module handles parsing and validation of command-line arguments.
//!
//! ## Arguments
//!
//! - `<torrent>`: Path to the .torrent file (required)
//! - `-o, --output <dir>`: Directory to download into (defaults to the current one)
//! - `-p, --port <port>`: Port reported to trackers
//! - `--pipeline <n>`: Block requests kept in flight per peer
//! - `--timeout <secs>`: Read timeout for peer connections
//! - `--no-resume`: Ignore and do not save download progress
//!
//! ## Example
//!
//! ```bash
//! leech debian.iso.torrent
//! leech debian.iso.torrent -o downloads --pipeline 5
//! ```

use leech::config::{Config, DEFAULT_PORT};

use clap::Parser;

use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent download client, written in Rust."
)]
pub struct Args {
    /// Path to the .torrent file
    pub torrent: PathBuf,

    /// Directory to download into
    #[arg(short = 'o', long, default_value = ".")]
    pub output: PathBuf,

    /// Port reported to trackers
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Block requests kept in flight per peer
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub pipeline: u16,

    /// Read timeout for peer connections, in seconds
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    /// Connection attempts before a peer is abandoned
    #[arg(long, default_value_t = 3)]
    pub connect_attempts: u32,

    /// Ignore and do not save download progress
    #[arg(long)]
    pub no_resume: bool,
}

impl Args {
    /// Settings for the download, starting from the defaults.
    pub fn config(&self) -> Config {
        Config {
            port: self.port,
            read_timeout: Duration::from_secs(self.timeout),
            connect_attempts: self.connect_attempts,
            pipeline_depth: self.pipeline as usize,
            resume: !self.no_resume,
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_config() {
        let args = Args::parse_from(["leech", "file.torrent"]);
        assert_eq!(args.torrent, PathBuf::from("file.torrent"));
        assert_eq!(args.config(), Config::default());
    }

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "leech",
            "file.torrent",
            "-o",
            "out",
            "--port",
            "7000",
            "--pipeline",
            "5",
            "--timeout",
            "10",
            "--no-resume",
        ]);
        let config = args.config();

        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(config.port, 7000);
        assert_eq!(config.pipeline_depth, 5);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert!(!config.resume);
    }

    #[test]
    fn rejects_empty_pipeline() {
        assert!(Args::try_parse_from(["leech", "file.torrent", "--pipeline", "0"]).is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        assert!(Args::try_parse_from(["leech", "file.torrent", "--timeout", "0"]).is_err());
        assert!(Args::try_parse_from(["leech", "file.torrent", "--timeout", "1"]).is_ok());
    }
}
