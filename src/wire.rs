//! Peer wire (BEP-3) client that fetches one torrent's info dictionary via
//! the BEP-10 extension protocol and BEP-9 ut_metadata piece exchange.

use crate::bencode::{self as be, BencodeError};
use crate::krpc::{dict_field, int_field};
use crate::types::InfoHash;
use crate::util::random_id20;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// ut_metadata transfers the info dictionary in pieces of this size.
pub const PIECE_SIZE: usize = 16384;
/// Anything larger than this is junk or abuse, not a torrent.
pub const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;
/// Largest peer-wire frame we are willing to buffer.
const MAX_FRAME: usize = 2 * 1024 * 1024;

const MSG_EXTENDED: u8 = 20;
const EXT_HANDSHAKE: u8 = 0;

const META_REQUEST: i64 = 0;
const META_DATA: i64 = 1;
const META_REJECT: i64 = 2;

// pstrlen + pstr + 8 reserved bytes with bit 20 (extension protocol) set
const HANDSHAKE_PREFIX: [u8; 28] = [
    19, b'B', b'i', b't', b'T', b'o', b'r', b'r', b'e', b'n', b't', b' ', b'p', b'r', b'o', b't',
    b'o', b'c', b'o', b'l', 0, 0, 0, 0, 0, 0x10, 0, 0,
];

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake mismatch")]
    HandshakeMismatch,
    #[error("peer offers no ut_metadata")]
    NoMetadataSupport,
    #[error("metadata size {0} over cap")]
    MetadataTooLarge(usize),
    #[error("frame length {0} over cap")]
    FrameTooLarge(usize),
    #[error("metadata piece {0} rejected")]
    PieceRejected(usize),
    #[error("metadata piece {0} malformed")]
    BadPiece(usize),
    #[error("metadata hash mismatch")]
    HashMismatch,
    #[error("malformed message: {0}")]
    Malformed(#[from] BencodeError),
    #[error("deadline exceeded")]
    Timeout,
}

/// One metadata fetch from one peer. The whole exchange — connect,
/// handshakes, every piece — shares a single deadline.
pub struct MetaWire {
    info_hash: InfoHash,
    peer: SocketAddr,
    deadline: Duration,
}

impl MetaWire {
    pub fn new(info_hash: InfoHash, peer: SocketAddr, deadline: Duration) -> Self {
        Self {
            info_hash,
            peer,
            deadline,
        }
    }

    /// Returns the raw bencoded info dictionary, already verified against
    /// the info hash. The connection is closed on every exit path.
    pub async fn fetch(&self) -> Result<Vec<u8>, WireError> {
        match timeout(self.deadline, self.exchange()).await {
            Ok(res) => res,
            Err(_) => Err(WireError::Timeout),
        }
    }

    async fn exchange(&self) -> Result<Vec<u8>, WireError> {
        let mut stream = TcpStream::connect(self.peer)
            .await
            .map_err(WireError::Connect)?;
        let _ = stream.set_nodelay(true);

        self.handshake(&mut stream).await?;
        let (ut_metadata, metadata_size) = self.extension_handshake(&mut stream).await?;
        let meta = self.download(&mut stream, ut_metadata, metadata_size).await?;

        let digest = Sha1::digest(&meta);
        if digest[..] != self.info_hash {
            return Err(WireError::HashMismatch);
        }
        Ok(meta)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), WireError> {
        let mut hs = [0u8; 68];
        hs[..28].copy_from_slice(&HANDSHAKE_PREFIX);
        hs[28..48].copy_from_slice(&self.info_hash);
        hs[48..].copy_from_slice(&random_id20());
        stream.write_all(&hs).await?;

        let mut reply = [0u8; 68];
        stream.read_exact(&mut reply).await?;
        let proto_ok = reply[0] == 19 && &reply[1..20] == b"BitTorrent protocol";
        let extensions_ok = reply[25] & 0x10 != 0;
        let hash_ok = reply[28..48] == self.info_hash;
        if !(proto_ok && extensions_ok && hash_ok) {
            return Err(WireError::HandshakeMismatch);
        }
        Ok(())
    }

    /// Advertise ut_metadata, then wait for the peer's extended handshake.
    /// Returns the peer-assigned ut_metadata sub-id and the metadata size.
    async fn extension_handshake(&self, stream: &mut TcpStream) -> Result<(u8, usize), WireError> {
        let body = be::encode(&be::dict(vec![(
            "m".into(),
            be::dict(vec![("ut_metadata".into(), be::int(1))]),
        )]));
        let mut msg = Vec::with_capacity(2 + body.len());
        msg.push(MSG_EXTENDED);
        msg.push(EXT_HANDSHAKE);
        msg.extend_from_slice(&body);
        send_frame(stream, &msg).await?;

        loop {
            let payload = match read_frame(stream).await? {
                Some(p) => p,
                None => continue, // keep-alive
            };
            if payload.first() != Some(&MSG_EXTENDED) || payload.get(1) != Some(&EXT_HANDSHAKE) {
                continue;
            }
            let (hs, _) = be::decode_dict(&payload[2..], 0)?;
            let ut_metadata = dict_field(&hs, "m")
                .and_then(|m| int_field(m, "ut_metadata"))
                .ok_or(WireError::NoMetadataSupport)?;
            let size = int_field(&hs, "metadata_size").ok_or(WireError::NoMetadataSupport)?;
            if size <= 0 {
                return Err(WireError::NoMetadataSupport);
            }
            let size = size as usize;
            if size > MAX_METADATA_SIZE {
                return Err(WireError::MetadataTooLarge(size));
            }
            return Ok((ut_metadata as u8, size));
        }
    }

    /// Request pieces in order, reading past unrelated traffic until each
    /// reply arrives, and assemble the full dictionary.
    async fn download(
        &self,
        stream: &mut TcpStream,
        ut_metadata: u8,
        metadata_size: usize,
    ) -> Result<Vec<u8>, WireError> {
        let pieces = metadata_size.div_ceil(PIECE_SIZE);
        let mut meta = Vec::with_capacity(metadata_size);
        for piece in 0..pieces {
            let head = be::encode(&be::dict(vec![
                ("msg_type".into(), be::int(META_REQUEST)),
                ("piece".into(), be::int(piece as i64)),
            ]));
            let mut msg = Vec::with_capacity(2 + head.len());
            msg.push(MSG_EXTENDED);
            msg.push(ut_metadata);
            msg.extend_from_slice(&head);
            send_frame(stream, &msg).await?;

            let data = self.read_piece(stream, piece, metadata_size, pieces).await?;
            meta.extend_from_slice(&data);
        }
        Ok(meta)
    }

    async fn read_piece(
        &self,
        stream: &mut TcpStream,
        piece: usize,
        metadata_size: usize,
        pieces: usize,
    ) -> Result<Vec<u8>, WireError> {
        loop {
            let payload = match read_frame(stream).await? {
                Some(p) => p,
                None => continue,
            };
            if payload.first() != Some(&MSG_EXTENDED) || payload.len() < 2 {
                continue;
            }
            if payload[1] == EXT_HANDSHAKE {
                continue; // some peers re-send their handshake
            }
            let Ok((head, data_at)) = be::decode_dict(&payload[2..], 0) else {
                continue; // other extension traffic, not for us
            };
            match int_field(&head, "msg_type") {
                Some(META_DATA) => {}
                Some(META_REJECT) if int_field(&head, "piece") == Some(piece as i64) => {
                    return Err(WireError::PieceRejected(piece));
                }
                _ => continue,
            }
            if int_field(&head, "piece") != Some(piece as i64) {
                continue;
            }
            if let Some(total) = int_field(&head, "total_size") {
                if total != metadata_size as i64 {
                    continue;
                }
            }
            let data = &payload[2 + data_at..];
            let expected = if piece == pieces - 1 {
                metadata_size - piece * PIECE_SIZE
            } else {
                PIECE_SIZE
            };
            if data.len() != expected {
                return Err(WireError::BadPiece(piece));
            }
            return Ok(data.to_vec());
        }
    }
}

/// Read one length-prefixed peer-wire frame. `None` is a keep-alive.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, WireError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn send_frame(stream: &mut TcpStream, data: &[u8]) -> Result<(), WireError> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
    stream.write_all(&buf).await?;
    Ok(())
}
