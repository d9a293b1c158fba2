//! Peer identity.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How peer identities are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityMode {
    /// Hash of the peer's listen address.
    AddrBased,
    /// Hash of the peer's certificate (DER). Falls back to the address
    /// when no certificate has been attached to the connection.
    CertBased,
}

/// 256-bit identity of a peer, stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Derive an identity from a socket address.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        let mut hasher = Sha256::new();
        match addr.ip() {
            IpAddr::V4(ip) => hasher.update(ip.octets()),
            IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.update(addr.port().to_le_bytes());
        Self(hasher.finalize().into())
    }

    /// Derive an identity from a certificate in DER form.
    pub fn from_cert_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..5] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_identity_stable() {
        let addr: SocketAddr = "127.0.0.1:9010".parse().unwrap();
        assert_eq!(PeerId::from_addr(&addr), PeerId::from_addr(&addr));
    }

    #[test]
    fn test_addr_identity_distinguishes_port() {
        let a = PeerId::from_addr(&"127.0.0.1:9010".parse().unwrap());
        let b = PeerId::from_addr(&"127.0.0.1:9020".parse().unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_cert_identity() {
        let a = PeerId::from_cert_der(b"cert-a");
        let b = PeerId::from_cert_der(b"cert-b");
        assert_ne!(a, b);
        assert_eq!(a, PeerId::from_cert_der(b"cert-a"));
    }

    #[test]
    fn test_display_is_short_hex() {
        let id = PeerId([0xab; 32]);
        assert_eq!(format!("{}", id), "ababababab");
    }
}
