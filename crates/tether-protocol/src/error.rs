//! Error types for the protocol layer.
//!
//! Two kinds of failure live here:
//!
//! - [`ProtocolError`]: a codec could not turn a value into bytes or
//!   back. Returned directly by [`Codec`](crate::Codec) calls.
//! - [`HandlerError`]: the sticky failure state of a
//!   [`Handler`](crate::Handler). Once set, the framing is considered
//!   broken and the handler must be reset.

/// Boxed error coming out of a serialization backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while encoding or decoding packet bodies.
///
/// The inner error is the original one from the codec backend
/// (`serde_json`, `bincode`), kept as the `source()` so it shows up in
/// error chains.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust value into bytes).
    #[error("encode failed: {0}")]
    Encode(#[source] BoxError),

    /// Deserialization failed: malformed, truncated or mistyped bytes.
    #[error("decode failed: {0}")]
    Decode(#[source] BoxError),
}

/// Sticky failure of a packet [`Handler`](crate::Handler).
///
/// The first error a handler hits is kept; later ones are dropped. The
/// `Display` text is the short snake-case name, which is what shows up
/// in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum HandlerError {
    /// The stream cannot take the whole frame right now.
    #[error("send_queue_full")]
    SendQueueFull,
    #[error("send_header_stream_failed")]
    SendHeaderStreamFailed,
    #[error("send_header_partial")]
    SendHeaderPartial,
    #[error("send_data_stream_failed")]
    SendDataStreamFailed,
    #[error("send_data_partial")]
    SendDataPartial,
    /// The codec could not encode the outgoing packet.
    #[error("send_data_serialize_failed")]
    SendDataSerializeFailed,
    #[error("receive_header_stream_failed")]
    ReceiveHeaderStreamFailed,
    #[error("receive_header_partial")]
    ReceiveHeaderPartial,
    /// Header id is 0 or beyond every registered listener.
    #[error("receive_header_bad_id")]
    ReceiveHeaderBadId,
    /// Header id is in range but nothing is registered for it.
    #[error("receive_packet_unknown")]
    ReceivePacketUnknown,
    #[error("receive_data_stream_failed")]
    ReceiveDataStreamFailed,
    /// The body arrived whole but the codec rejected it.
    #[error("receive_data_deserialize_failed")]
    ReceiveDataDeserializeFailed,
    /// Only part of the body could be read; the stream is out of sync.
    #[error("receive_data_partial")]
    ReceiveDataPartial,
    #[error("receive_no_receiver")]
    ReceiveNoReceiver,
    /// The application receiver returned `false`.
    #[error("receive_receiver_failed")]
    ReceiveReceiverFailed,
}

impl HandlerError {
    /// `true` for errors raised on the send path.
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            Self::SendQueueFull
                | Self::SendHeaderStreamFailed
                | Self::SendHeaderPartial
                | Self::SendDataStreamFailed
                | Self::SendDataPartial
                | Self::SendDataSerializeFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_names() {
        assert_eq!(HandlerError::SendQueueFull.to_string(), "send_queue_full");
        assert_eq!(
            HandlerError::ReceiveReceiverFailed.to_string(),
            "receive_receiver_failed"
        );
    }

    #[test]
    fn test_send_side_classification() {
        assert!(HandlerError::SendDataPartial.is_send());
        assert!(!HandlerError::ReceiveHeaderBadId.is_send());
    }

    #[test]
    fn test_protocol_error_keeps_source() {
        use std::error::Error;
        let inner = std::io::Error::other("boom");
        let err = ProtocolError::Decode(Box::new(inner));
        assert_eq!(err.to_string(), "decode failed: boom");
        assert!(err.source().is_some());
    }
}
