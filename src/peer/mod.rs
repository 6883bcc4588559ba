//! The peer session: one async task per connected peer, driving a single
//! TCP connection through handshake, availability exchange, and the
//! request/response loop that actually pulls piece data (§4.3).

pub mod codec;

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::Conf,
    error::{Error, Result},
    piece_store::PieceStore,
    storage_info::TorrentInfo,
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

use codec::{BlockInfo, Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING};

/// The phase a [`PeerSession`] is currently in, mirrored in every log line
/// so a session's lifetime can be reconstructed from the log alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
    Disconnected,
}

/// Releases a claimed piece back to the [`PieceStore`] on drop unless the
/// claim was consumed by [`ClaimGuard::complete`] first.
///
/// This exists purely to make the "every held claim is released on every
/// exit path" invariant structural rather than something each early return
/// in the request loop has to remember by hand.
struct ClaimGuard<'a> {
    store: &'a PieceStore,
    index: PieceIndex,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(store: &'a PieceStore, index: PieceIndex) -> Self {
        Self { store, index, armed: true }
    }

    /// Marks the piece completed and disarms the guard so `Drop` doesn't
    /// also release it.
    fn complete(mut self, bytes: Vec<u8>) {
        self.store.complete(self.index, bytes);
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.release(self.index);
        }
    }
}

/// Drives a single outbound connection to one peer for the lifetime of a
/// download, claiming and fetching pieces from the shared [`PieceStore`]
/// until the peer has nothing left we need or the connection fails.
pub struct PeerSession {
    addr: SocketAddr,
    peer_id: PeerId,
    info_hash: Sha1Hash,
    conf: Arc<Conf>,
    torrent_info: Arc<TorrentInfo>,
    piece_store: Arc<PieceStore>,
    state: State,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddr,
        peer_id: PeerId,
        info_hash: Sha1Hash,
        conf: Arc<Conf>,
        torrent_info: Arc<TorrentInfo>,
        piece_store: Arc<PieceStore>,
    ) -> Self {
        Self {
            addr,
            peer_id,
            info_hash,
            conf,
            torrent_info,
            piece_store,
            state: State::Disconnected,
        }
    }

    /// Runs the session to completion: connect, handshake, exchange
    /// availability, then request pieces until none remain that this peer
    /// has and we don't, or the connection becomes unusable.
    ///
    /// Returns `Ok(())` for every outcome that isn't this session's own
    /// fault (the peer disconnecting, having nothing we need, or hitting
    /// the consecutive-failure cap are all just "this peer is done for
    /// now", not propagated errors per §7).
    pub async fn run(&mut self) -> Result<()> {
        let mut socket = self.connect_and_handshake().await?;
        let mut peer_bitfield = self.exchange_availability(&mut socket).await?;

        if !self.has_useful_piece(&peer_bitfield) {
            log::info!("{} has nothing we're missing, nothing to do", self.addr);
            return Ok(());
        }

        self.become_interested(&mut socket).await?;
        self.request_loop(&mut socket, &mut peer_bitfield).await
    }

    /// Whether the peer's bitfield advertises at least one piece the store
    /// doesn't already have.
    fn has_useful_piece(&self, peer_bitfield: &Bitfield) -> bool {
        self.piece_store
            .missing_indices()
            .iter()
            .any(|&index| index < peer_bitfield.len() && peer_bitfield[index])
    }

    async fn connect_and_handshake(
        &mut self,
    ) -> Result<Framed<TcpStream, PeerCodec>> {
        self.state = State::Connecting;
        log::info!("connecting to {}", self.addr);
        let socket = timeout(self.conf.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Malformed(format!("connect to {} timed out", self.addr)))??;

        self.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let handshake = Handshake::new(self.info_hash, self.peer_id);
        socket.send(handshake).await?;

        let peer_handshake = timeout(self.conf.read_timeout, socket.next())
            .await
            .map_err(|_| Error::Malformed(format!("handshake from {} timed out", self.addr)))?
            .ok_or_else(|| {
                Error::Malformed(format!("{} closed connection during handshake", self.addr))
            })??;

        if peer_handshake.prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::HandshakeRejected(format!(
                "{} sent an unrecognized protocol string",
                self.addr
            )));
        }
        if peer_handshake.info_hash != self.info_hash {
            return Err(Error::HandshakeRejected(format!(
                "{} advertised a mismatched info hash",
                self.addr
            )));
        }

        log::info!("handshake with {} complete", self.addr);

        // swap the handshake codec out for the peer message codec, carrying
        // over any bytes the peer has already sent (they'd belong to the
        // bitfield message, the first thing we expect next)
        let parts = socket.into_parts();
        let mut new_parts = FramedParts::new(parts.io, PeerCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    async fn exchange_availability(&mut self, socket: &mut Framed<TcpStream, PeerCodec>) -> Result<Bitfield> {
        self.state = State::AvailabilityExchange;
        let msg = timeout(self.conf.read_timeout, socket.next())
            .await
            .map_err(|_| Error::NoBitfield)?
            .ok_or(Error::NoBitfield)??;
        match msg {
            Message::Bitfield(bytes) => {
                log::debug!("{} sent bitfield ({} bytes)", self.addr, bytes.len());
                Ok(Bitfield::from_vec(bytes))
            }
            _ => Err(Error::NoBitfield),
        }
    }

    async fn become_interested(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        socket.send(Message::Interested).await?;
        self.state = State::Connected;

        // loop on incoming messages (a peer may send Have or Choke before
        // finally unchoking us) until we see Unchoke or time out
        loop {
            let msg = timeout(self.conf.read_timeout, socket.next())
                .await
                .map_err(|_| Error::NotUnchoked)?
                .ok_or(Error::NotUnchoked)??;
            match msg {
                Message::Unchoke => {
                    log::info!("{} unchoked us", self.addr);
                    return Ok(());
                }
                Message::Choke | Message::Have { .. } | Message::KeepAlive => continue,
                other => {
                    log::debug!("{} sent {:?} while awaiting unchoke", self.addr, other);
                    continue;
                }
            }
        }
    }

    async fn request_loop(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        peer_bitfield: &mut Bitfield,
    ) -> Result<()> {
        let mut consecutive_failures = 0u32;

        loop {
            let index = match self.claim_next_piece(peer_bitfield) {
                Some(index) => index,
                None => {
                    log::info!("{} has nothing left we need", self.addr);
                    return Ok(());
                }
            };

            match self.fetch_piece(socket, index).await {
                Ok(()) => {
                    consecutive_failures = 0;
                }
                Err(err) => {
                    log::warn!("{} failed piece {}: {}", self.addr, index, err);
                    consecutive_failures += 1;
                    if consecutive_failures >= self.conf.max_consecutive_failures {
                        return Err(Error::TooManyFailures);
                    }
                }
            }
        }
    }

    /// Picks the lowest-indexed piece that the peer's bitfield advertises
    /// and the store doesn't already own, claiming it atomically.
    fn claim_next_piece(&self, peer_bitfield: &Bitfield) -> Option<PieceIndex> {
        for index in self.piece_store.missing_indices() {
            if index < peer_bitfield.len()
                && peer_bitfield[index]
                && self.piece_store.try_claim(index)
            {
                return Some(index);
            }
        }
        None
    }

    /// Fetches every block of `index`, verifies its hash, and records it as
    /// completed. On any failure the claim is released (via [`ClaimGuard`])
    /// and a session-local error is returned; the caller decides whether
    /// this counts toward the consecutive-failure cap.
    async fn fetch_piece(
        &self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        index: PieceIndex,
    ) -> Result<()> {
        let guard = ClaimGuard::new(&self.piece_store, index);
        let piece_len = self.torrent_info.piece_len(index)?;

        let mut blocks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut offset = 0u32;
        while offset < piece_len {
            let len = std::cmp::min(self.conf.block_len, piece_len - offset);
            let block = self
                .request_block_with_retries(socket, index, offset, len)
                .await?;
            blocks.insert(offset, block);
            offset += len;
        }

        let mut piece = Vec::with_capacity(piece_len as usize);
        for (_, block) in blocks {
            piece.extend_from_slice(&block);
        }

        let expected = self.torrent_info.piece_hashes[index];
        let actual: Sha1Hash = {
            let digest = Sha1::digest(&piece);
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        };
        if actual != expected {
            return Err(Error::Malformed(format!(
                "piece {} failed hash verification",
                index
            )));
        }

        guard.complete(piece);
        Ok(())
    }

    /// Requests a single block, retrying up to
    /// [`Conf::max_block_retries`] times on timeout, a malformed reply, or
    /// a reply for the wrong block (the peer is allowed to interleave other
    /// pieces' blocks with ours, but this client only ever has one
    /// outstanding request at a time, so any mismatch is treated as a
    /// retryable failure rather than reordering logic).
    async fn request_block_with_retries(
        &self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .request_block_once(socket, piece_index, offset, len)
                .await
            {
                Ok(data) => return Ok(data),
                Err(err) if attempts > self.conf.max_block_retries => return Err(err),
                Err(err) => {
                    log::debug!(
                        "{} block ({}, {}) attempt {} failed: {}",
                        self.addr,
                        piece_index,
                        offset,
                        attempts,
                        err
                    );
                }
            }
        }
    }

    async fn request_block_once(
        &self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        socket
            .send(Message::Request(BlockInfo {
                piece_index: piece_index as u32,
                offset,
                len,
            }))
            .await?;

        loop {
            let msg = timeout(self.conf.read_timeout, socket.next())
                .await
                .map_err(|_| {
                    Error::Malformed(format!(
                        "{} timed out replying to block request",
                        self.addr
                    ))
                })?
                .ok_or_else(|| {
                    Error::Malformed(format!("{} closed connection mid-request", self.addr))
                })??;

            match msg {
                Message::Piece { piece_index: got_index, offset: got_offset, data } => {
                    if got_index as usize != piece_index || got_offset != offset {
                        return Err(Error::Malformed(format!(
                            "{} sent block for ({}, {}), expected ({}, {})",
                            self.addr, got_index, got_offset, piece_index, offset
                        )));
                    }
                    if data.len() != len as usize {
                        return Err(Error::Malformed(format!(
                            "{} sent block of length {}, expected {}",
                            self.addr,
                            data.len(),
                            len
                        )));
                    }
                    return Ok(data);
                }
                Message::Choke => {
                    return Err(Error::Malformed(format!("{} choked us mid-request", self.addr)));
                }
                Message::Have { .. } | Message::KeepAlive => continue,
                other => {
                    log::debug!("{} sent unexpected {:?} during request", self.addr, other);
                    continue;
                }
            }
        }
    }
}
