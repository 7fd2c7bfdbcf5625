use std::fmt;

use bitchat_proto::handshake::PEER_ID_LEN;
use rand::rngs::OsRng;
use rand::RngCore;

/// A 160-bit peer identifier.
///
/// Generated randomly once per process; opaque, not bound to any key
/// material. Equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PEER_ID_LEN] {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_byte_equality() {
        let a = PeerId::from_bytes([3; PEER_ID_LEN]);
        let b = PeerId::from_bytes([3; PEER_ID_LEN]);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), &[3; PEER_ID_LEN]);
    }

    #[test]
    fn test_display_is_hex() {
        let id = PeerId::from_bytes([0xA5; PEER_ID_LEN]);
        assert_eq!(id.to_string(), "a5".repeat(PEER_ID_LEN));
    }
}
