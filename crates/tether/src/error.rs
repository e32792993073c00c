//! Unified error type for the Tether framework.

use tether_protocol::{HandlerError, ProtocolError};
use tether_stream::StreamError;
use tether_transport::SocketError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tether` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant auto-generates `From` impls, so the `?`
/// operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A byte-stream error (buffer flush, detached stream, OS error).
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A socket state machine error (busy, wrong state, failed socket).
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// A codec error (encode or decode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The packet handler's sticky framing error.
    #[error("packet handler failed: {0}")]
    Handler(#[from] HandlerError),
}
