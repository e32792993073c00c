//! Platform seam: the raw descriptor operations the state machines use.
//!
//! [`Client`](crate::Client), [`Server`](crate::Server) and
//! [`ServerClient`](crate::ServerClient) only talk to [`RawSocket`]; the
//! concrete [`Descriptor`] is chosen at build time.

use std::io;

use crate::{Address, Disposition};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::Descriptor;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::Descriptor;

/// Which readiness conditions a poll asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
}

/// Result of a zero-timeout poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or, on a listener, a connection) is waiting.
    pub readable: bool,
    pub writable: bool,
    /// The peer hung up.
    pub hangup: bool,
    /// An error is pending on the socket.
    pub error: bool,
}

/// A non-blocking OS socket.
///
/// Dropping the value closes the descriptor.
pub trait RawSocket: Sized {
    /// Creates a stream socket of the family `address` belongs to.
    fn open(address: &Address) -> io::Result<Self>;

    fn connect(&self, address: &Address) -> io::Result<()>;
    fn bind(&self, address: &Address) -> io::Result<()>;
    fn listen(&self, backlog: i32) -> io::Result<()>;
    /// Pulls one pending connection off a listening socket.
    fn accept(&self) -> io::Result<Self>;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    /// Bytes ready to read without blocking.
    fn read_size(&self) -> io::Result<usize>;

    fn set_blocking(&self, blocking: bool) -> io::Result<()>;
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
    /// Half-closes the write side.
    fn shutdown_write(&self) -> io::Result<()>;

    /// Zero-timeout readiness check.
    fn poll(&self, interest: Interest) -> io::Result<Readiness>;
    /// Takes the pending `SO_ERROR`, if any.
    fn take_error(&self) -> io::Result<Option<io::Error>>;
    fn local_addr(&self) -> io::Result<Option<Address>>;

    /// Sorts an OS error into retry / disconnect / fatal.
    fn classify(err: &io::Error) -> Disposition;
}

/// Classification shared by the backends, keyed on `io::ErrorKind`.
pub(crate) fn classify_kind(kind: io::ErrorKind) -> Option<Disposition> {
    match kind {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Some(Disposition::Retry),
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => Some(Disposition::Disconnect),
        _ => None,
    }
}
