//! The crate-wide error type and result alias.
//!
//! Per-block and per-piece failures (retried block requests, a piece whose
//! SHA-1 doesn't match) are *not* represented here: the specification treats
//! those as locally recoverable and they never leave the peer session as an
//! [`Error`]. This type only covers failures that terminate a peer session,
//! the whole download, or one of the ambient collaborators (metainfo
//! decoding, the tracker client, disk I/O).

use std::path::PathBuf;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// All fatal error conditions the engine and its collaborators can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The metainfo file could not be bencode-decoded.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(#[from] serde_bencode::Error),

    /// The metainfo's `info` dictionary was structurally valid bencode but
    /// didn't describe a coherent torrent (e.g. neither `length` nor `files`
    /// present, or an empty piece hash list).
    #[error("malformed torrent info: {0}")]
    MalformedTorrentInfo(String),

    /// The tracker could not be reached, returned a non-success status, or
    /// its response body was not a well-formed bencoded peer list.
    #[error("tracker request failed: {0}")]
    Tracker(String),

    /// A lower-level HTTP failure while talking to the tracker.
    #[error("tracker http error: {0}")]
    TrackerHttp(#[from] reqwest::Error),

    /// A wire message violated the framing rules in section 4.1: truncated
    /// length-prefixed frame, wrong payload length for a known message id,
    /// or an invalid handshake.
    #[error("malformed peer message: {0}")]
    Malformed(String),

    /// The peer's handshake reply didn't match our info hash or protocol
    /// string.
    #[error("peer handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The peer didn't send a bitfield as the first post-handshake message.
    #[error("peer sent no initial bitfield")]
    NoBitfield,

    /// The peer never unchoked us (or disconnected) while we waited for
    /// permission to request blocks.
    #[error("peer did not unchoke")]
    NotUnchoked,

    /// Three consecutive I/O failures (read, write, or timeout) on one
    /// connection.
    #[error("too many consecutive I/O failures with peer")]
    TooManyFailures,

    /// The piece store observed an operation that violates its invariants
    /// (double-release, double-complete). These indicate a bug in the
    /// session driving the store, not a remote failure, so they are fatal.
    #[error("piece store invariant violated: {0}")]
    InvariantViolation(String),

    /// The download finished (no more peers to try) without completing
    /// every piece.
    #[error("download incomplete: {completed}/{total} pieces")]
    Incomplete {
        completed: usize,
        total: usize,
    },

    /// Writing assembled pieces to disk failed.
    #[error("disk I/O error for {path}: {source}")]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bare I/O error with no associated path (socket errors etc.).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
