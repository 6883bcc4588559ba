//! The wire codec: the handshake framing and the post-handshake peer message
//! framing (§4.1 of the design).
//!
//! Two codecs exist because the handshake has its own fixed-length framing
//! (protocol string length prefix, then a fixed 49-byte tail) while every
//! message that follows it uses a 4-byte big-endian length prefix. A
//! [`PeerSession`](super::PeerSession) parses exactly one [`Handshake`] with
//! [`HandshakeCodec`], then swaps to [`PeerCodec`] for the rest of the
//! connection's lifetime by moving the underlying socket and any buffered
//! bytes from one `Framed` into the other.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{PeerId, Sha1Hash};

/// The fixed protocol identifier string sent in every handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Maximum accepted frame length for a post-handshake message, guarding
/// against a malicious or corrupt peer claiming an enormous length prefix.
const MAX_MESSAGE_LEN: usize = 1 << 20;

/// The 68-byte handshake message exchanged as the very first thing on a new
/// peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Builds a handshake for the given torrent and local peer id, with an
    /// all-zero reserved field (we advertise no extensions).
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Encodes and decodes [`Handshake`] messages.
///
/// Unlike [`PeerCodec`], this codec has no length-prefix framing of its own:
/// the handshake's shape is fixed, so `decode` simply waits for the full
/// 68 bytes to arrive.
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let Handshake { prot, reserved, info_hash, peer_id } = handshake;
        buf.reserve(1 + prot.len() + reserved.len() + info_hash.len() + peer_id.len());
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != 19 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported protocol string length {}", prot_len),
            ));
        }
        let total_len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        let mut buf = buf.split_to(total_len);
        buf.advance(1);

        let mut prot = [0u8; 19];
        prot.copy_from_slice(&buf[..19]);
        buf.advance(19);

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[..8]);
        buf.advance(8);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[..20]);

        Ok(Some(Handshake { prot, reserved, info_hash, peer_id }))
    }
}

/// A block request or delivery payload, shared by the `Request`, `Cancel`
/// (unused by this leech-only client, but part of the wire format) and
/// `Piece` message variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub len: u32,
}

/// The post-handshake peer wire protocol messages this client sends or
/// understands (§4.1). `Cancel`, `Port`, and the extension messages of the
/// full protocol are intentionally absent: this is a leech-only client that
/// never needs to cancel a request it issued or advertise a DHT port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece { piece_index: u32, offset: u32, data: Vec<u8> },
    /// A message id this client doesn't implement (`cancel`, `port`, a
    /// fast-extension or future protocol id, …). Per §4.1 these MUST be
    /// skipped rather than treated as a framing error.
    Unknown { id: u8 },
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
}

/// Encodes and decodes length-prefixed post-handshake [`Message`]s.
///
/// Every frame is a 4-byte big-endian length (covering the id byte and
/// payload, but not the length prefix itself) followed by that many bytes.
/// A length of zero is a keep-alive with no id or payload.
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(id::CHOKE);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(id::UNCHOKE);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(id::INTERESTED);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(id::NOT_INTERESTED);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(id::HAVE);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(id::BITFIELD);
                buf.extend_from_slice(&bits);
            }
            Message::Request(BlockInfo { piece_index, offset, len }) => {
                buf.put_u32(13);
                buf.put_u8(id::REQUEST);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.put_u32(len);
            }
            Message::Piece { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(id::PIECE);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            buf.advance(4);
            // a keep-alive carries no payload; recurse in case another
            // frame is already buffered behind it
            return self.decode(buf);
        }

        if len > MAX_MESSAGE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message length {} exceeds maximum {}", len, MAX_MESSAGE_LEN),
            ));
        }

        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(4 + len);
        frame.advance(4);
        let id = frame[0];
        frame.advance(1);

        let msg = match id {
            id::CHOKE => Message::Choke,
            id::UNCHOKE => Message::Unchoke,
            id::INTERESTED => Message::Interested,
            id::NOT_INTERESTED => Message::NotInterested,
            id::HAVE => {
                if frame.len() != 4 {
                    return Err(invalid_len("have", frame.len()));
                }
                Message::Have { piece_index: frame.get_u32() }
            }
            id::BITFIELD => Message::Bitfield(frame.to_vec()),
            id::REQUEST => {
                if frame.len() != 12 {
                    return Err(invalid_len("request", frame.len()));
                }
                Message::Request(BlockInfo {
                    piece_index: frame.get_u32(),
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                })
            }
            id::PIECE => {
                if frame.len() < 8 {
                    return Err(invalid_len("piece", frame.len()));
                }
                let piece_index = frame.get_u32();
                let offset = frame.get_u32();
                Message::Piece { piece_index, offset, data: frame.to_vec() }
            }
            other => Message::Unknown { id: other },
        };

        Ok(Some(msg))
    }
}

fn invalid_len(kind: &str, len: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("malformed {} message: unexpected payload length {}", kind, len),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_decode_waits_for_full_frame() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut full = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..30]);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn rejects_bad_protocol_string_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(20);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_round_trips_and_is_skipped() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Unchoke);
        assert!(buf.is_empty());
    }

    #[test]
    fn request_round_trips() {
        let req = Message::Request(BlockInfo { piece_index: 3, offset: 16384, len: 16384 });
        let mut buf = BytesMut::new();
        PeerCodec.encode(req.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn piece_round_trips() {
        let piece = Message::Piece { piece_index: 1, offset: 0, data: vec![9, 9, 9] };
        let mut buf = BytesMut::new();
        PeerCodec.encode(piece.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, piece);
    }

    #[test]
    fn bitfield_round_trips() {
        let bitfield = Message::Bitfield(vec![0b1010_0000, 0b0000_0001]);
        let mut buf = BytesMut::new();
        PeerCodec.encode(bitfield.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, bitfield);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Have { piece_index: 7 }, &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert_eq!(PeerCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_LEN + 1) as u32);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn skips_unknown_message_id_instead_of_erroring() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Unknown { id: 200 });
    }
}
