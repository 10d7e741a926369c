use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// pstrlen(1) + protocol(19) + reserved(8) + descriptor_id(32) + peer_id(20).
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 32 + 20;

pub struct Handshake {
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub descriptor_id: [u8; 32],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(descriptor_id: [u8; 32], peer_id: [u8; 20]) -> Self {
        Self {
            protocol: PROTOCOL,
            reserved: [0; 8],
            descriptor_id,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.descriptor_id);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len(), HANDSHAKE_LEN, "encoded handshake length is not {HANDSHAKE_LEN} bytes");
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

        let protocol_len = src[0];
        if protocol_len != 19 {
            return Err(PeerError::IncorrectProtocol);
        }

        if src.remaining() < HANDSHAKE_LEN {
            return Ok(None);
        }

        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut descriptor_id = [0; 32];
        src.copy_to_slice(&mut descriptor_id);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { protocol, reserved, descriptor_id, peer_id }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("descriptor_id", &hex::encode(self.descriptor_id))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_handshake_bytes() -> BytesMut {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        src.extend_from_slice(&[0; 8]);
        src.extend_from_slice(&[0xAB; 32]);
        src.extend_from_slice(&[0xCD; 20]);
        src
    }

    #[test]
    fn test_handshake_decoding() {
        let mut src = full_handshake_bytes();
        let mut decoder = HandshakeCodec;
        let handshake = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.protocol, *b"BitTorrent protocol");
        assert_eq!(handshake.reserved, [0; 8]);
        assert_eq!(handshake.descriptor_id, [0xAB; 32]);
        assert_eq!(handshake.peer_id, [0xCD; 20]);
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        let mut decoder = HandshakeCodec;
        let handshake = decoder.decode(&mut src);
        assert!(handshake.unwrap().is_none());
    }

    #[test]
    fn test_handshake_decoding_with_invalid_protocol_len() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol");
        src.extend_from_slice(&[0; 8]);
        src.extend_from_slice(&[0; 32]);
        src.extend_from_slice(&[0; 20]);

        let mut decoder = HandshakeCodec;
        let handshake = decoder.decode(&mut src);
        assert!(handshake.is_err());
    }

    #[test]
    fn test_handshake_decoding_with_extra_data() {
        let mut src = full_handshake_bytes();
        src.extend_from_slice(&[0; 10]); // start of the next message

        let mut decoder = HandshakeCodec;
        let handshake = decoder.decode(&mut src);
        assert!(handshake.unwrap().is_some());
        assert_eq!(src.len(), 10);
    }

    #[test]
    fn round_trips_through_encoder_and_decoder() {
        let handshake = Handshake::new([7; 32], [9; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.descriptor_id, [7; 32]);
        assert_eq!(decoded.peer_id, [9; 20]);
    }
}
