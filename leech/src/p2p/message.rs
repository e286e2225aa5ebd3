use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{BlockData, BlockInfo},
    Bitfield,
};
use super::PeerError;

// Generous upper bound on a frame: a block message is 9 + 16KiB, bitfields of
// even very large torrents stay well under this.
const MAX_FRAME_LEN: usize = 0x20000;

#[cfg_attr(test, derive(Clone, PartialEq, Eq))]
#[derive(Debug)]
pub enum Message {

    // A zero-length frame; only proof of life.
    KeepAlive,

    // No further requests from the peer will be satisfied.
    Choke,

    // Requests from the peer will now be served.
    Unchoke,

    // We would like to request blocks from the peer.
    Interested,

    NotInterested,

    // The sender has completed and verified the piece at idx.
    Have { idx: u32 },

    // Complete piece map, sent once directly after the handshake. MSB-first:
    // bit i sits at position 7 - (i % 8) of byte i / 8.
    Bitfield(Bitfield),

    Request(BlockInfo),

    // Named "piece" on the wire.
    Block(BlockData),

    Cancel(BlockInfo),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // keep-alive: <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // choke: <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // unchoke: <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // interested: <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // not interested: <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read the length prefix yet.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_len = peeker.get_u32() as usize;
        if msg_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLong(msg_len));
        }

        if src.remaining() < 4 + msg_len {
            // Frame not fully received.
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let payload_len = msg_len - 1;
        let msg = match src.get_u8() {
            0 if payload_len == 0 => Message::Choke,
            1 if payload_len == 0 => Message::Unchoke,
            2 if payload_len == 0 => Message::Interested,
            3 if payload_len == 0 => Message::NotInterested,
            4 if payload_len == 4 => Message::Have { idx: src.get_u32() },
            5 => {
                let mut raw = vec![0; payload_len];
                src.copy_to_slice(&mut raw);
                Message::Bitfield(Bitfield::from_vec(raw))
            },
            6 if payload_len == 12 => Message::Request(BlockInfo {
                piece_idx: src.get_u32() as usize,
                offset: src.get_u32() as usize,
                len: src.get_u32() as usize,
            }),
            7 if payload_len >= 8 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; payload_len - 8];
                src.copy_to_slice(&mut data);
                Message::Block(BlockData { piece_idx, offset, data })
            },
            8 if payload_len == 12 => Message::Cancel(BlockInfo {
                piece_idx: src.get_u32() as usize,
                offset: src.get_u32() as usize,
                len: src.get_u32() as usize,
            }),
            id if id <= 8 => {
                // Known id with a payload of the wrong shape.
                tracing::warn!("malformed payload for message id {}", id);
                return Err(PeerError::InvalidMessage);
            },
            id => {
                // Unknown ids are skipped for forward compatibility.
                tracing::debug!("ignoring unknown message id {}", id);
                src.advance(payload_len);
                return self.decode(src);
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(
                f,
                "request {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
            Message::Block(block) => write!(
                f,
                "block {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.data.len(),
            ),
            Message::Cancel(block) => write!(
                f,
                "cancel {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_msg_stream() {

        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Cancel
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x8, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
            Message::Cancel(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut buf = BytesMut::new();

        // First half of an interested message.
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        // Second half.
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Interested));

        // First half of a piece message.
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        // Second half.
        buf.extend_from_slice(&[0x2, 0x3]);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap(),
            Some(Message::Block(BlockData {
                piece_idx: 0xb,
                offset: 0x134000,
                data: vec![0x1, 0x2, 0x3],
            })),
        );
    }

    #[test]
    fn test_msg_decode_empty() {
        let mut src = BytesMut::new();
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_msg_decode_unknown_id_skipped() {
        // An extended message (id 20) followed by interested: the unknown
        // frame is consumed and the next message comes out.
        let mut src = BytesMut::from(&[0u8, 0, 0, 3, 20, 0xaa, 0xbb, 0, 0, 0, 1, 2][..]);
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), Some(Message::Interested));
        assert!(src.is_empty());
    }

    #[test]
    fn test_msg_decode_oversized_frame() {
        let mut src = BytesMut::from(&[0x7fu8, 0xff, 0xff, 0xff, 7][..]);
        assert!(matches!(
            MessageCodec.decode(&mut src),
            Err(PeerError::FrameTooLong(_))
        ));
    }

    #[test]
    fn test_msg_decode_malformed_payload() {
        // A have message with two bytes of payload.
        let mut src = BytesMut::from(&[0u8, 0, 0, 3, 4, 0, 0][..]);
        assert!(matches!(
            MessageCodec.decode(&mut src),
            Err(PeerError::InvalidMessage)
        ));
    }
}
