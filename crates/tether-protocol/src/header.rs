//! The fixed 8-byte frame header.
//!
//! Every packet on the wire is a header followed by exactly `size` body
//! bytes:
//!
//! ```text
//! +----------------+----------------+------------------------+
//! | id   (u32 LE)  | size (u32 LE)  | body (size bytes)      |
//! +----------------+----------------+------------------------+
//! ```
//!
//! Id 0 is reserved. Inside a [`Handler`](crate::Handler) it means "no
//! header pending", so real packet ids start at 1. An empty body
//! (`size == 0`) is legal.

/// Numeric packet identifier. `0` is reserved.
pub type PacketId = u32;

/// Encoded length of a [`Header`].
pub const HEADER_SIZE: usize = 8;

/// Frame header: which packet, and how many body bytes follow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Header {
    pub id: PacketId,
    pub size: u32,
}

impl Header {
    pub fn new(id: PacketId, size: u32) -> Self {
        Self { id, size }
    }

    /// `true` when this slot holds a real header (id != 0).
    pub fn is_pending(&self) -> bool {
        self.id != 0
    }

    /// Encodes as `id` then `size`, both little-endian.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let [a, b, c, d, e, f, g, h] = *raw;
        Self {
            id: u32::from_le_bytes([a, b, c, d]),
            size: u32::from_le_bytes([e, f, g, h]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_little_endian() {
        let raw = Header::new(0x0102_0304, 5).encode();
        assert_eq!(raw, [4, 3, 2, 1, 5, 0, 0, 0]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let header = Header::new(42, 1_000_000);
        assert_eq!(Header::decode(&header.encode()), header);
    }

    #[test]
    fn test_default_is_not_pending() {
        assert!(!Header::default().is_pending());
        assert!(Header::new(1, 0).is_pending());
    }
}
