use tether_stream::StreamError;

/// Errors returned by socket state machine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    /// The operation is not allowed in the socket's current state.
    #[error("{op} is not allowed in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// The socket is already connecting or connected.
    #[error("socket is busy")]
    Busy,

    /// The operating system reported a failure.
    #[error(transparent)]
    Io(#[from] StreamError),
}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.into())
    }
}

/// How a state machine reacts to a failed OS call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to do yet (would block, in progress). Reported as zero bytes.
    Retry,
    /// The peer went away (broken pipe, reset). The socket moves to its
    /// closing state and the call reports zero bytes.
    Disconnect,
    /// Anything else. The error becomes sticky and the socket fails.
    Fatal,
}
