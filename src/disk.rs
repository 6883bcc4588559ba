//! The assembler: writes a completed download's pieces to their final files
//! on disk (§4.5).
//!
//! Pieces routinely span a file boundary in multi-file torrents, so the
//! concatenated byte stream produced by [`PieceStore::finalize`] has to be
//! carved back up according to each file's offset within that stream. This
//! client only ever performs the one final write once every piece has
//! verified, so there's no need for the incremental, per-piece disk
//! scheduling a seeding client would require — the whole write happens on
//! a blocking thread via [`tokio::task::spawn_blocking`].

use std::{
    fs,
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use crate::{
    error::{Error, Result},
    piece_store::PieceStore,
    storage_info::{FileInfo, FsStructure, TorrentInfo},
};

/// Verifies the download finished, then writes every file to disk.
pub async fn write_to_disk(
    torrent_info: Arc<TorrentInfo>,
    piece_store: Arc<PieceStore>,
) -> Result<()> {
    piece_store.ensure_done()?;
    let data = piece_store.finalize();

    tokio::task::spawn_blocking(move || write_blocking(&torrent_info.structure, &data))
        .await
        .expect("disk writer task panicked")
}

fn write_blocking(structure: &FsStructure, data: &[u8]) -> Result<()> {
    log::debug!(
        "writing {} byte download to disk ({})",
        data.len(),
        if structure.is_archive() { "multi-file" } else { "single-file" }
    );
    match structure {
        FsStructure::File(file) => write_file(file, data, 0),
        FsStructure::Archive { files } => {
            for file in files {
                write_file(file, data, file.torrent_offset as usize)?;
            }
            Ok(())
        }
    }
}

fn write_file(file: &FileInfo, data: &[u8], offset: usize) -> Result<()> {
    if let Some(parent) = file.path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::Disk {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let slice = &data[offset..offset + file.len as usize];
    write_slice(&file.path, slice)
}

fn write_slice(path: &Path, slice: &[u8]) -> Result<()> {
    let mut handle = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|source| Error::Disk { path: path.to_path_buf(), source })?;

    handle
        .seek(SeekFrom::Start(0))
        .map_err(|source| Error::Disk { path: path.to_path_buf(), source })?;
    handle
        .write_all(slice)
        .map_err(|source| Error::Disk { path: path.to_path_buf(), source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn hash(bytes: &[u8]) -> [u8; 20] {
        let digest = Sha1::digest(bytes);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    #[tokio::test]
    async fn writes_a_single_file_download() {
        let dir = std::env::temp_dir().join(format!("sbt-disk-test-{}", unique_suffix()));
        let data = b"hello assembler".to_vec();
        let path = dir.join("out.bin");

        let torrent_info = Arc::new(TorrentInfo::new(
            [0; 20],
            data.len() as u32,
            vec![hash(&data)],
            FsStructure::File(FileInfo {
                path: path.clone(),
                len: data.len() as u64,
                torrent_offset: 0,
            }),
        ));
        let piece_store = Arc::new(PieceStore::new(1));
        piece_store.try_claim(0);
        piece_store.complete(0, data.clone());

        write_to_disk(torrent_info, piece_store).await.unwrap();

        let written = fs::read(&path).unwrap();
        assert_eq!(written, data);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn splits_a_multi_file_download_at_the_right_offsets() {
        let dir = std::env::temp_dir().join(format!("sbt-disk-test-multi-{}", unique_suffix()));
        let part_a = b"AAAA".to_vec();
        let part_b = b"BBBBBBBB".to_vec();
        let mut combined = part_a.clone();
        combined.extend_from_slice(&part_b);

        let files = vec![
            FileInfo { path: dir.join("a.bin"), len: part_a.len() as u64, torrent_offset: 0 },
            FileInfo {
                path: dir.join("b.bin"),
                len: part_b.len() as u64,
                torrent_offset: part_a.len() as u64,
            },
        ];
        let torrent_info = Arc::new(TorrentInfo::new(
            [0; 20],
            combined.len() as u32,
            vec![hash(&combined)],
            FsStructure::Archive { files },
        ));
        let piece_store = Arc::new(PieceStore::new(1));
        piece_store.try_claim(0);
        piece_store.complete(0, combined);

        write_to_disk(torrent_info, piece_store).await.unwrap();

        assert_eq!(fs::read(dir.join("a.bin")).unwrap(), part_a);
        assert_eq!(fs::read(dir.join("b.bin")).unwrap(), part_b);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn refuses_to_write_an_incomplete_download() {
        let torrent_info = Arc::new(TorrentInfo::new(
            [0; 20],
            4,
            vec![[0; 20], [0; 20]],
            FsStructure::File(FileInfo {
                path: std::env::temp_dir().join("never-written.bin"),
                len: 8,
                torrent_offset: 0,
            }),
        ));
        let piece_store = Arc::new(PieceStore::new(2));
        let result = write_to_disk(torrent_info, piece_store).await;
        assert!(matches!(result, Err(Error::Incomplete { .. })));
    }

    // gives each test its own scratch directory so concurrent test runs
    // don't collide
    fn unique_suffix() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!("{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
