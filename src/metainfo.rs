//! Bencode decoding of `.torrent` files.
//!
//! This is the "metainfo parser" collaborator named in the core
//! specification: it is deliberately narrow, exposing only what the engine
//! needs (info hash, piece length, piece hashes, file layout) via
//! [`Metainfo::into_torrent_info`].

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure, TorrentInfo},
    Sha1Hash,
};
use sha1::{Digest, Sha1};

/// The top-level bencoded dictionary of a `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    /// Parses a metainfo file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the SHA-1 info hash by re-encoding the `info` dictionary
    /// exactly as it appeared (bencode's canonical form is unique, so
    /// round-tripping through our `Info` struct reproduces the same bytes
    /// the original encoder produced).
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Converts the decoded metainfo into the engine's read-only
    /// [`TorrentInfo`] descriptor.
    pub fn into_torrent_info(
        self,
        download_dir: std::path::PathBuf,
    ) -> Result<TorrentInfo> {
        let info_hash = self.info_hash()?;

        if self.info.pieces.len() % 20 != 0 || self.info.pieces.is_empty() {
            return Err(Error::MalformedTorrentInfo(format!(
                "piece hash string length {} is not a positive multiple of 20",
                self.info.pieces.len()
            )));
        }
        let piece_hashes: Vec<Sha1Hash> = self
            .info
            .pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let structure = match (self.info.length, self.info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: download_dir.join(&self.info.name),
                len,
                torrent_offset: 0,
            }),
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::MalformedTorrentInfo(
                        "multi-file torrent with empty file list".into(),
                    ));
                }
                let mut torrent_offset = 0;
                let mut out = Vec::with_capacity(files.len());
                for file in files {
                    let len = file.length as u64;
                    let path: std::path::PathBuf =
                        file.path.iter().collect();
                    out.push(FileInfo {
                        path: download_dir.join(&self.info.name).join(path),
                        len,
                        torrent_offset,
                    });
                    torrent_offset += len;
                }
                FsStructure::Archive { files: out }
            }
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::MalformedTorrentInfo(
                    "info dictionary must have exactly one of `length` or `files`"
                        .into(),
                ))
            }
        };

        if self.info.piece_length == 0 {
            return Err(Error::MalformedTorrentInfo(
                "piece length must be positive".into(),
            ));
        }

        Ok(TorrentInfo::new(
            info_hash,
            self.info.piece_length as u32,
            piece_hashes,
            structure,
        ))
    }
}

/// The bencoded `info` dictionary of a `.torrent` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

/// One file entry in a multi-file torrent's `files` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
