use std::path::PathBuf;

use crate::{error::*, PieceIndex, Sha1Hash};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's full path, already joined with the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

/// The read-only descriptor of a torrent's storage layout, derived from its
/// metainfo. This is the "Info descriptor" of the core specification: it is
/// immutable for the lifetime of a download and freely shared (behind an
/// `Arc`) across every peer session.
#[derive(Clone, Debug)]
pub struct TorrentInfo {
    /// 20-byte SHA-1 digest of the bencoded info dictionary.
    pub info_hash: Sha1Hash,
    /// The nominal length of a piece, in bytes.
    pub piece_len: u32,
    /// The length of the last piece, which may differ from `piece_len` if
    /// the download size isn't an exact multiple of it.
    pub last_piece_len: u32,
    /// The expected SHA-1 digest of each piece, indexed by piece index.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The file system structure of the download.
    pub structure: FsStructure,
}

impl TorrentInfo {
    /// Builds a torrent info descriptor from its constituent parts,
    /// deriving `last_piece_len` and `download_len` from the file
    /// structure.
    pub fn new(
        info_hash: Sha1Hash,
        piece_len: u32,
        piece_hashes: Vec<Sha1Hash>,
        structure: FsStructure,
    ) -> Self {
        let download_len = structure.download_len();
        let piece_count = piece_hashes.len() as u64;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1);
        Self {
            info_hash,
            piece_len,
            last_piece_len: last_piece_len as u32,
            piece_hashes,
            download_len,
            structure,
        }
    }

    /// The total number of pieces in the torrent.
    pub fn total_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        let total = self.total_pieces();
        if index == total - 1 {
            Ok(self.last_piece_len)
        } else if index < total - 1 {
            Ok(self.piece_len)
        } else {
            Err(Error::InvariantViolation(format!(
                "piece index {} out of bounds ({} pieces)",
                index, total
            )))
        }
    }
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested
    /// directories.
    Archive {
        /// A flattened list of all files in the archive, in the order they
        /// appear in the torrent.
        files: Vec<FileInfo>,
    },
}

impl FsStructure {
    /// Returns true if the download is for an archive (multiple files).
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Returns the total download size in bytes.
    pub fn download_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }
}
