use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::ID;
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// 1 length byte + protocol + 8 reserved + info hash + peer id.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

pub struct Handshake {

    pub info_hash: ID,

    pub peer_id: ID,

}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        Self { info_hash, peer_id }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL.len() as u8);
        dst.extend_from_slice(&PROTOCOL);
        dst.put_bytes(0, 8); // reserved, no extensions
        dst.extend_from_slice(&handshake.info_hash);
        dst.extend_from_slice(&handshake.peer_id);
        debug_assert_eq!(dst.len(), HANDSHAKE_LEN);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }
        // The length prefix is enough to reject a foreign protocol without
        // waiting for the full handshake.
        if src[0] as usize != PROTOCOL.len() {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        src.advance(1);
        let mut protocol = [0u8; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }
        src.advance(8); // reserved bits are ignored

        let mut info_hash = [0u8; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}
