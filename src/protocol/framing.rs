//! Frame-level codec for the wire header.
//!
//! Decoding alternates between two states: waiting for a complete header
//! (opcode, length, checksum), then waiting for `length` payload bytes.
//! A header declaring more than `max_msg_size` is a hard error; a frame
//! whose checksum does not verify is dropped and decoding re-enters the
//! header state.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::protocol::{checksum_of, header_size, Envelope, Opcode};

/// Codec for length-prefixed, checksummed frames.
#[derive(Debug)]
pub struct FrameCodec<O> {
    max_msg_size: usize,
    magic: u32,
    /// Parsed header of the frame currently being read, if any.
    header: Option<(O, usize, u32)>,
}

impl<O: Opcode> FrameCodec<O> {
    /// Create a codec with the given payload limit and magic.
    pub fn new(max_msg_size: usize, magic: u32) -> Self {
        Self {
            max_msg_size,
            magic,
            header: None,
        }
    }
}

impl<O: Opcode> Decoder for FrameCodec<O> {
    type Item = Envelope<O>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if self.header.is_none() {
                if src.len() < header_size::<O>() {
                    // Not enough data for a header
                    return Ok(None);
                }

                let opcode = O::get(src);
                let length = src.get_u32_le() as usize;
                let checksum = src.get_u32_le();

                if length > self.max_msg_size {
                    return Err(Error::OversizedMsg {
                        size: length,
                        max: self.max_msg_size,
                    });
                }

                self.header = Some((opcode, length, checksum));
            }

            let (opcode, length, checksum) = self.header.unwrap();

            if src.len() < length {
                // Reserve space for the rest of the payload
                src.reserve(length - src.len());
                return Ok(None);
            }

            let payload = src.split_to(length).freeze();
            self.header = None;

            if !cfg!(feature = "nochecksum")
                && checksum_of(&payload) ^ self.magic != checksum
            {
                tracing::warn!(opcode = %opcode, "checksum mismatch, dropping message");
                continue;
            }

            return Ok(Some(Envelope::new(opcode, payload, self.magic)));
        }
    }
}

impl<O: Opcode> Encoder<Envelope<O>> for FrameCodec<O> {
    type Error = Error;

    fn encode(&mut self, env: Envelope<O>, dst: &mut BytesMut) -> Result<()> {
        if env.len() > self.max_msg_size {
            return Err(Error::OversizedMsg {
                size: env.len(),
                max: self.max_msg_size,
            });
        }

        dst.extend_from_slice(&env.to_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    fn codec() -> FrameCodec<u8> {
        FrameCodec::new(1024, 0)
    }

    fn env(opcode: u8, payload: &'static [u8]) -> Envelope<u8> {
        Envelope::new(opcode, Bytes::from_static(payload), 0)
    }

    #[test]
    fn test_roundtrip() {
        let mut codec = codec();
        let mut buf = BytesMut::new();

        codec.encode(env(0x01, b"hello"), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.opcode(), 0x01);
        assert_eq!(&decoded.payload()[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_header() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x01, 5, 0]);
        // Only 3 bytes, not enough for a header

        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_partial_payload() {
        let mut codec = codec();
        let mut buf = BytesMut::new();

        codec.encode(env(0x01, b"hello world"), &mut buf).unwrap();
        let mut truncated = buf.split_to(buf.len() - 4);

        assert!(codec.decode(&mut truncated).unwrap().is_none());

        // Feeding the rest completes the frame
        truncated.unsplit(buf);
        let decoded = codec.decode(&mut truncated).unwrap().unwrap();
        assert_eq!(&decoded.payload()[..], b"hello world");
    }

    #[test]
    fn test_oversized_header() {
        let mut codec = FrameCodec::<u8>::new(16, 0);
        let mut buf = BytesMut::new();
        buf.put_u8(0x01);
        buf.put_u32_le(1024);
        buf.put_u32_le(0);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(Error::OversizedMsg { size: 1024, max: 16 })));
    }

    #[test]
    fn test_oversized_encode() {
        let mut codec = FrameCodec::<u8>::new(4, 0);
        let mut buf = BytesMut::new();
        let result = codec.encode(env(0x01, b"too long"), &mut buf);
        assert!(matches!(result, Err(Error::OversizedMsg { .. })));
    }

    #[cfg(not(feature = "nochecksum"))]
    #[test]
    fn test_bad_checksum_dropped() {
        let mut codec = codec();
        let mut buf = BytesMut::new();

        codec.encode(env(0x01, b"first"), &mut buf).unwrap();
        // Corrupt the first frame's payload
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        codec.encode(env(0x02, b"second"), &mut buf).unwrap();

        // The corrupted frame is skipped, the next one comes through
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.opcode(), 0x02);
        assert_eq!(&decoded.payload()[..], b"second");
    }

    #[test]
    fn test_magic_mismatch_dropped() {
        let mut sender = FrameCodec::<u8>::new(1024, 0xdeadbeef);
        let mut receiver = codec();
        let mut buf = BytesMut::new();

        sender
            .encode(Envelope::new(0x01u8, Bytes::from_static(b"x"), 0xdeadbeef), &mut buf)
            .unwrap();

        if cfg!(feature = "nochecksum") {
            assert!(receiver.decode(&mut buf).unwrap().is_some());
        } else {
            assert!(receiver.decode(&mut buf).unwrap().is_none());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_multiple_messages() {
        let mut codec = codec();
        let mut buf = BytesMut::new();

        codec.encode(env(0x01, b"one"), &mut buf).unwrap();
        codec.encode(env(0x02, b"two"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.opcode(), 0x01);

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.opcode(), 0x02);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = codec();
        let mut buf = BytesMut::new();

        codec.encode(env(0x07, b""), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.opcode(), 0x07);
        assert!(decoded.is_empty());
    }
}
