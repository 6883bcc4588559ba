//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The global configuration for the download engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The directory in which the torrent's files are placed once assembled.
    pub download_dir: PathBuf,

    /// How long to wait for a TCP connection to a peer to complete.
    pub connect_timeout: Duration,

    /// How long to wait for any single framed message from a peer (the
    /// handshake reply, the bitfield, the unchoke, or a piece message)
    /// before treating the read as a failure.
    pub read_timeout: Duration,

    /// The fixed length of a block request, except possibly for the last
    /// block of the last piece. Always [`crate::BLOCK_LEN`] in this client;
    /// kept here so callers have one place to see the value used throughout
    /// the engine.
    pub block_len: u32,

    /// The number of times a single block request is retried before its
    /// piece is released back to the store.
    pub max_block_retries: u32,

    /// The number of consecutive I/O failures (timeouts, read/write errors,
    /// unexpected message ids) a session tolerates before it terminates the
    /// connection.
    pub max_consecutive_failures: u32,
}

impl Conf {
    /// Returns the engine configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(5),
            block_len: crate::BLOCK_LEN,
            max_block_retries: 3,
            max_consecutive_failures: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let conf = Conf::new("/tmp/does-not-matter");
        assert_eq!(conf.connect_timeout, Duration::from_secs(3));
        assert_eq!(conf.read_timeout, Duration::from_secs(5));
        assert_eq!(conf.max_block_retries, 3);
        assert_eq!(conf.max_consecutive_failures, 3);
        assert_eq!(conf.block_len, 16384);
    }
}
