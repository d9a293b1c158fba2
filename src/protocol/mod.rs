//! Wire message representation.
//!
//! Every message on the wire is framed as:
//! - O bytes: opcode (width given by the [`Opcode`] impl)
//! - 4 bytes: little-endian payload length
//! - 4 bytes: little-endian checksum
//! - N bytes: payload
//!
//! The checksum is the first four bytes of SHA-256 over the payload,
//! XORed with the network magic, so frames from a network with a
//! different magic fail verification and are dropped at parse time.

pub mod framing;

use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub use framing::FrameCodec;

/// Fixed-width opcode carried in every frame header.
pub trait Opcode:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Number of bytes the opcode occupies on the wire.
    const WIDTH: usize;

    /// Append the opcode to a buffer.
    fn put(&self, dst: &mut BytesMut);

    /// Consume the opcode from a buffer holding at least `WIDTH` bytes.
    fn get(src: &mut BytesMut) -> Self;
}

impl Opcode for u8 {
    const WIDTH: usize = 1;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(*self);
    }

    fn get(src: &mut BytesMut) -> Self {
        src.get_u8()
    }
}

impl Opcode for u16 {
    const WIDTH: usize = 2;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u16_le(*self);
    }

    fn get(src: &mut BytesMut) -> Self {
        src.get_u16_le()
    }
}

/// Size of the frame header for a given opcode type.
pub const fn header_size<O: Opcode>() -> usize {
    O::WIDTH + 8
}

/// Typed message with a fixed opcode and its own payload encoding.
pub trait WireMsg<O: Opcode>: Sized + Send + 'static {
    /// The opcode this message type is routed by.
    const OPCODE: O;

    /// Append the payload encoding of this message.
    fn encode(&self, dst: &mut BytesMut);

    /// Decode a message from its payload bytes.
    fn decode(src: &mut Bytes) -> Result<Self>;
}

/// First four bytes of SHA-256 over the payload, little-endian.
pub(crate) fn checksum_of(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A framed message: opcode plus opaque payload.
#[derive(Debug, Clone)]
pub struct Envelope<O> {
    opcode: O,
    magic: u32,
    payload: Bytes,
}

impl<O: Opcode> Envelope<O> {
    /// Wrap raw payload bytes under an opcode.
    pub fn new(opcode: O, payload: Bytes, magic: u32) -> Self {
        Self { opcode, magic, payload }
    }

    /// Serialize a typed message into an envelope.
    pub fn pack<M: WireMsg<O>>(msg: &M, magic: u32) -> Self {
        let mut payload = BytesMut::new();
        msg.encode(&mut payload);
        Self::new(M::OPCODE, payload.freeze(), magic)
    }

    /// The opcode this envelope is routed by.
    pub fn opcode(&self) -> O {
        self.opcode
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The checksum written into this envelope's header.
    pub fn checksum(&self) -> u32 {
        checksum_of(&self.payload) ^ self.magic
    }

    /// Decode the payload into a typed message.
    pub fn open<M: WireMsg<O>>(&self) -> Result<M> {
        let mut payload = self.payload.clone();
        M::decode(&mut payload)
    }

    /// Serialize header plus payload into a single buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(header_size::<O>() + self.payload.len());
        self.opcode.put(&mut buf);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(self.checksum());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

impl<O: Opcode> fmt::Display for Envelope<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<msg opcode={} len={}>", self.opcode, self.payload.len())
    }
}

/// Canonical wire encoding of a socket address: 4 IPv4 octets followed
/// by a little-endian port. Only IPv4 addresses can be carried.
pub fn put_addr(addr: &SocketAddr, dst: &mut BytesMut) -> Result<()> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            dst.put_slice(&ip.octets());
            dst.put_u16_le(addr.port());
            Ok(())
        }
        IpAddr::V6(_) => Err(Error::InvalidAddress(addr.to_string())),
    }
}

/// Decode an address in the canonical encoding.
pub fn get_addr(src: &mut Bytes) -> Result<SocketAddr> {
    if src.remaining() < 6 {
        return Err(Error::Decode("truncated address"));
    }
    let mut octets = [0u8; 4];
    src.copy_to_slice(&mut octets);
    let port = src.get_u16_le();
    Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(Vec<u8>);

    impl WireMsg<u8> for Echo {
        const OPCODE: u8 = 0x01;

        fn encode(&self, dst: &mut BytesMut) {
            dst.put_slice(&self.0);
        }

        fn decode(src: &mut Bytes) -> Result<Self> {
            Ok(Echo(src.to_vec()))
        }
    }

    #[test]
    fn test_envelope_pack_open() {
        let msg = Echo(b"hello".to_vec());
        let env = Envelope::pack(&msg, 0);

        assert_eq!(env.opcode(), 0x01);
        assert_eq!(env.len(), 5);

        let back: Echo = env.open().unwrap();
        assert_eq!(back.0, b"hello");
    }

    #[test]
    fn test_envelope_header_layout() {
        let env = Envelope::new(0x42u8, Bytes::from_static(b"abc"), 0);
        let bytes = env.to_bytes();

        assert_eq!(bytes.len(), header_size::<u8>() + 3);
        assert_eq!(bytes[0], 0x42);
        assert_eq!(&bytes[1..5], &3u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &env.checksum().to_le_bytes());
        assert_eq!(&bytes[9..], b"abc");
    }

    #[test]
    fn test_checksum_folds_magic() {
        let a = Envelope::new(0x01u8, Bytes::from_static(b"x"), 0);
        let b = Envelope::new(0x01u8, Bytes::from_static(b"x"), 0xdeadbeef);
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum() ^ 0xdeadbeef, b.checksum());
    }

    #[test]
    fn test_u16_opcode_width() {
        let env = Envelope::new(0x0102u16, Bytes::from_static(b""), 0);
        let bytes = env.to_bytes();
        assert_eq!(bytes.len(), header_size::<u16>());
        assert_eq!(&bytes[0..2], &0x0102u16.to_le_bytes());
    }

    #[test]
    fn test_addr_roundtrip() {
        let addr: SocketAddr = "10.1.2.3:9001".parse().unwrap();
        let mut buf = BytesMut::new();
        put_addr(&addr, &mut buf).unwrap();
        assert_eq!(buf.len(), 6);

        let mut src = buf.freeze();
        let back = get_addr(&mut src).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_addr_rejects_ipv6() {
        let addr: SocketAddr = "[::1]:9001".parse().unwrap();
        let mut buf = BytesMut::new();
        assert!(matches!(
            put_addr(&addr, &mut buf),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_addr_truncated() {
        let mut src = Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(get_addr(&mut src), Err(Error::Decode(_))));
    }
}
