//! The orchestrator: spawns one peer session per candidate peer and waits
//! for the download to finish or for every session to give up (§4.4).

use std::sync::Arc;

use crate::{
    conf::Conf,
    error::{Error, Result},
    peer::PeerSession,
    piece_store::PieceStore,
    storage_info::TorrentInfo,
    PeerId,
};
use std::net::SocketAddr;

/// Runs a download to completion against the given set of candidate peers.
///
/// One tokio task per peer is spawned via [`PeerSession::run`]; all of them
/// share the same [`PieceStore`], which is the only coordination between
/// them. The orchestrator itself does no retrying or re-announcing: per the
/// scope of this client, a single round of peers from the tracker is all it
/// attempts (§2, Non-goals).
pub async fn run_download(
    peers: Vec<SocketAddr>,
    peer_id: PeerId,
    conf: Arc<Conf>,
    torrent_info: Arc<TorrentInfo>,
    piece_store: Arc<PieceStore>,
) -> Result<()> {
    let mut tasks = Vec::with_capacity(peers.len());
    for addr in peers {
        let conf = Arc::clone(&conf);
        let torrent_info = Arc::clone(&torrent_info);
        let piece_store = Arc::clone(&piece_store);
        tasks.push(tokio::spawn(async move {
            let mut session = PeerSession::new(
                addr,
                peer_id,
                torrent_info.info_hash,
                conf,
                torrent_info,
                piece_store,
            );
            if let Err(err) = session.run().await {
                log::warn!("session with {} ended: {}", addr, err);
            }
        }));
    }

    for task in tasks {
        // a panicking session task is a bug worth surfacing loudly, but it
        // must not prevent the other sessions' progress from being counted
        if let Err(join_err) = task.await {
            log::error!("peer session task panicked: {}", join_err);
        }
    }

    if piece_store.is_done() {
        Ok(())
    } else {
        Err(Error::Incomplete {
            completed: piece_store.completed_count(),
            total: piece_store.total_pieces(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use std::path::PathBuf;

    #[tokio::test]
    async fn reports_incomplete_with_no_peers() {
        let torrent_info = Arc::new(TorrentInfo::new(
            [0; 20],
            4,
            vec![[0; 20]],
            FsStructure::File(FileInfo {
                path: PathBuf::from("/tmp/x"),
                len: 4,
                torrent_offset: 0,
            }),
        ));
        let piece_store = Arc::new(PieceStore::new(1));
        let conf = Arc::new(Conf::new("/tmp"));

        let result = run_download(
            vec![],
            crate::generate_peer_id(),
            conf,
            torrent_info,
            piece_store,
        )
        .await;

        assert!(matches!(result, Err(Error::Incomplete { completed: 0, total: 1 })));
    }
}
