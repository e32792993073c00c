//! Codec trait and implementations for packet bodies.
//!
//! A "codec" (coder/decoder) converts between Rust types and raw bytes.
//! The [`Handler`](crate::Handler) frames bodies with a header but does
//! not care HOW the body was produced. It only needs something that
//! implements [`Codec`], so the wire format can be swapped without
//! touching any listener code.
//!
//! Two codecs ship with the crate:
//!
//! - [`JsonCodec`]: human-readable, easy to inspect in a packet dump.
//! - [`BincodeCodec`]: compact binary, the better default for real
//!   traffic.
//!
//! Each is behind a feature flag of the same name (both on by default).

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// ## Trait bounds explained
///
/// - `'static` → the codec owns everything it needs; a handler keeps it
///   for its whole lifetime.
///
/// ## Generic methods
///
/// `encode` and `decode` are generic over the value type:
/// - `encode<T: Serialize>` → T can be turned into bytes
/// - `decode<T: DeserializeOwned>` → T can be created from bytes
///
/// `DeserializeOwned` (vs plain `Deserialize`) means the result does not
/// borrow from the input. The handler reuses its body buffer for the
/// next frame, so a decoded packet must own its data.
pub trait Codec: 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value cannot be
    /// represented in this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use tether_protocol::{Codec, JsonCodec};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&(1u32, "hi")).unwrap();
/// assert_eq!(bytes, br#"[1,"hi"]"#);
///
/// let back: (u32, String) = codec.decode(&bytes).unwrap();
/// assert_eq!(back, (1, "hi".to_string()));
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(Box::new(e)))
    }
}

// ---------------------------------------------------------------------------
// BincodeCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses bincode's default (little-endian, fixed-width
/// integer) encoding.
///
/// ```rust
/// use tether_protocol::{BincodeCodec, Codec};
///
/// let bytes = BincodeCodec.encode(&7u32).unwrap();
/// assert_eq!(bytes, [7, 0, 0, 0]);
/// ```
#[cfg(feature = "bincode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

#[cfg(feature = "bincode")]
impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(value).map_err(|e| ProtocolError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(Box::new(e)))
    }
}
