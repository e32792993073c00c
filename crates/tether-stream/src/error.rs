//! Error types for the stream layer.

use std::io;

/// Errors reported by a byte stream.
///
/// Unlike `std::io::Error`, this type is `Clone` and comparable: streams
/// keep the first failure as a sticky value and hand out copies of it on
/// every later call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream has no backing stream attached.
    #[error("stream is not configured")]
    NotConfigured,

    /// The stream does not support this operation (e.g. `peek` on a
    /// write-only sink).
    #[error("operation is not implemented by this stream")]
    NotImplemented,

    /// The operating system reported an error with a raw code.
    #[error("{kind} (os error {code})")]
    Os { kind: io::ErrorKind, code: i32 },

    /// An I/O error without an OS code.
    #[error("{0}")]
    Io(io::ErrorKind),
}

impl StreamError {
    /// The `std::io` category of this error.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::NotConfigured => io::ErrorKind::NotConnected,
            Self::NotImplemented => io::ErrorKind::Unsupported,
            Self::Os { kind, .. } | Self::Io(kind) => *kind,
        }
    }

    /// The raw OS error code, if one was captured.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::Os {
                kind: err.kind(),
                code,
            },
            None => Self::Io(err.kind()),
        }
    }
}

impl From<io::ErrorKind> for StreamError {
    fn from(kind: io::ErrorKind) -> Self {
        Self::Io(kind)
    }
}
