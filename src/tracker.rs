//! The HTTP tracker client: announces this client to the torrent's tracker
//! and decodes the returned compact peer list (§10.2).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use serde_bytes::ByteBuf;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// Characters the tracker announce query must percent-encode. Bencoded
/// `info_hash` and `peer_id` are raw 20-byte strings, not necessarily valid
/// UTF-8, so they can't go through `reqwest`'s `.query()` (which assumes
/// UTF-8-serializable values); this set matches what other BitTorrent
/// clients send, leaving alphanumerics and `-_.~` unescaped.
const ANNOUNCE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'$')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// The bencoded tracker announce response.
#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    peers: ByteBuf,
}

/// A thin client around a torrent's announce URL.
pub struct TrackerClient {
    http: reqwest::Client,
    announce: String,
}

impl TrackerClient {
    pub fn new(announce: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, announce: announce.into() })
    }

    /// Sends a single `started` announce and returns the peers the tracker
    /// reports, decoded from its compact (6-bytes-per-peer) representation.
    ///
    /// This client never re-announces on an interval or on completion: a
    /// leech-only, single-round download only needs the one initial peer
    /// list (§2, Non-goals).
    pub async fn announce(
        &self,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
        left: u64,
    ) -> Result<Vec<SocketAddr>> {
        let url = format!(
            "{}?{}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
            self.announce,
            Self::announce_query(info_hash, peer_id),
            port,
            left,
        );

        let body = self.http.get(&url).send().await?.bytes().await?;
        let response: AnnounceResponse = serde_bencode::from_bytes(&body)
            .map_err(|e| Error::Tracker(format!("malformed tracker response: {}", e)))?;

        if let Some(reason) = response.failure_reason {
            return Err(Error::Tracker(reason));
        }
        log::debug!("tracker announce interval: {}s", response.interval);

        Self::decode_compact_peers(&response.peers)
    }

    fn announce_query(info_hash: Sha1Hash, peer_id: PeerId) -> String {
        format!(
            "info_hash={}&peer_id={}",
            percent_encode(&info_hash, ANNOUNCE_ENCODE_SET),
            percent_encode(&peer_id, ANNOUNCE_ENCODE_SET),
        )
    }

    fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
        if bytes.len() % 6 != 0 {
            return Err(Error::Tracker(format!(
                "compact peer list length {} is not a multiple of 6",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peer_list() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 5, 0x00, 0x50];
        let peers = TrackerClient::decode_compact_peers(&bytes).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.5:80".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn rejects_misaligned_peer_list() {
        let bytes = [1, 2, 3, 4, 5];
        assert!(TrackerClient::decode_compact_peers(&bytes).is_err());
    }

    #[test]
    fn announce_query_percent_encodes_raw_bytes() {
        let info_hash = [0xffu8; 20];
        let peer_id = *b"-SB001-abcdefghijklm";
        let query = TrackerClient::announce_query(info_hash, peer_id);
        assert!(query.starts_with("info_hash=%FF%FF"));
        assert!(query.contains("peer_id=-SB001-abcdefghijklm"));
    }
}
