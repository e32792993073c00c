//! Byte-stream abstraction layer for Tether.
//!
//! A stream has two independent ends:
//!
//! - the **read end** ([`ReadStream`]): sized reads, non-destructive
//!   peeks, a queryable number of bytes ready to read, and an explicit
//!   flush that pulls more data from whatever backs the stream;
//! - the **write end** ([`WriteStream`]): sized writes, a queryable
//!   amount of room left, and an explicit flush that pushes staged data
//!   further down.
//!
//! Every operation is non-blocking. "No progress" is reported as
//! `Ok(0)`, never as a wait. Higher layers (the packet handler) use
//! `read_size()` / `write_size()` to avoid calling `read` / `write`
//! against a zero-capacity condition.
//!
//! # Provided streams
//!
//! - [`BufferedStream`]: wraps any [`ByteStream`] with fixed-capacity
//!   read-ahead and write-behind buffers.
//! - [`Fifo`]: an unbounded in-memory loopback (what you write is what
//!   you read), plus [`duplex`] for a connected pair of endpoints.

use std::cell::RefCell;
use std::rc::Rc;

mod buffered;
mod error;
mod fifo;

pub use buffered::{BufferConfig, BufferedStream};
pub use error::StreamError;
pub use fifo::{duplex, DuplexEnd, Fifo};

/// Outcome of a sized stream operation: bytes processed, or the failure.
pub type StreamResult = Result<usize, StreamError>;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// The read end of a stream.
pub trait ReadStream {
    /// Moves up to `buf.len()` bytes out of the stream.
    ///
    /// Returns the number of bytes copied. `Ok(0)` means nothing is
    /// available right now.
    fn read(&mut self, buf: &mut [u8]) -> StreamResult;

    /// Copies up to `buf.len()` bytes without consuming them.
    fn peek(&mut self, _buf: &mut [u8]) -> StreamResult {
        Err(StreamError::NotImplemented)
    }

    /// Refills the read end from the backing source, if there is one.
    fn read_flush(&mut self) -> Result<(), StreamError> {
        Err(StreamError::NotImplemented)
    }

    /// Number of bytes that can be read right now without blocking.
    fn read_size(&mut self) -> StreamResult;

    /// The sticky error of the read end, if any.
    fn read_error(&self) -> Option<StreamError>;
}

/// The write end of a stream.
pub trait WriteStream {
    /// Accepts up to `buf.len()` bytes. Partial writes are allowed; the
    /// caller retries the remainder.
    fn write(&mut self, buf: &[u8]) -> StreamResult;

    /// Pushes staged bytes to the backing sink, if there is one.
    fn write_flush(&mut self) -> Result<(), StreamError> {
        Err(StreamError::NotImplemented)
    }

    /// Number of bytes the stream can accept right now.
    fn write_size(&mut self) -> StreamResult;

    /// The sticky error of the write end, if any.
    fn write_error(&self) -> Option<StreamError>;
}

/// A stream with both ends.
pub trait ByteStream: ReadStream + WriteStream {
    /// Flushes the read end, then the write end.
    fn flush(&mut self) -> Result<(), StreamError> {
        self.read_flush()?;
        self.write_flush()
    }

    /// The first error seen on either end.
    fn error(&self) -> Option<StreamError> {
        self.read_error().or_else(|| self.write_error())
    }
}

// ---------------------------------------------------------------------------
// Forwarding impls
// ---------------------------------------------------------------------------

macro_rules! forward_deref {
    ($($ty:ty),* $(,)?) => {$(
        impl<T: ReadStream + ?Sized> ReadStream for $ty {
            fn read(&mut self, buf: &mut [u8]) -> StreamResult {
                (**self).read(buf)
            }
            fn peek(&mut self, buf: &mut [u8]) -> StreamResult {
                (**self).peek(buf)
            }
            fn read_flush(&mut self) -> Result<(), StreamError> {
                (**self).read_flush()
            }
            fn read_size(&mut self) -> StreamResult {
                (**self).read_size()
            }
            fn read_error(&self) -> Option<StreamError> {
                (**self).read_error()
            }
        }

        impl<T: WriteStream + ?Sized> WriteStream for $ty {
            fn write(&mut self, buf: &[u8]) -> StreamResult {
                (**self).write(buf)
            }
            fn write_flush(&mut self) -> Result<(), StreamError> {
                (**self).write_flush()
            }
            fn write_size(&mut self) -> StreamResult {
                (**self).write_size()
            }
            fn write_error(&self) -> Option<StreamError> {
                (**self).write_error()
            }
        }

        impl<T: ByteStream + ?Sized> ByteStream for $ty {
            fn flush(&mut self) -> Result<(), StreamError> {
                (**self).flush()
            }
            fn error(&self) -> Option<StreamError> {
                (**self).error()
            }
        }
    )*};
}

forward_deref!(&mut T, Box<T>);

// A shared stream: the owner (e.g. a server's client list) and a handler
// can both hold it. Borrows last for a single call only.

impl<T: ReadStream + ?Sized> ReadStream for Rc<RefCell<T>> {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult {
        self.borrow_mut().read(buf)
    }
    fn peek(&mut self, buf: &mut [u8]) -> StreamResult {
        self.borrow_mut().peek(buf)
    }
    fn read_flush(&mut self) -> Result<(), StreamError> {
        self.borrow_mut().read_flush()
    }
    fn read_size(&mut self) -> StreamResult {
        self.borrow_mut().read_size()
    }
    fn read_error(&self) -> Option<StreamError> {
        self.borrow().read_error()
    }
}

impl<T: WriteStream + ?Sized> WriteStream for Rc<RefCell<T>> {
    fn write(&mut self, buf: &[u8]) -> StreamResult {
        self.borrow_mut().write(buf)
    }
    fn write_flush(&mut self) -> Result<(), StreamError> {
        self.borrow_mut().write_flush()
    }
    fn write_size(&mut self) -> StreamResult {
        self.borrow_mut().write_size()
    }
    fn write_error(&self) -> Option<StreamError> {
        self.borrow().write_error()
    }
}

impl<T: ByteStream + ?Sized> ByteStream for Rc<RefCell<T>> {
    fn flush(&mut self) -> Result<(), StreamError> {
        self.borrow_mut().flush()
    }
    fn error(&self) -> Option<StreamError> {
        self.borrow().error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_stream_sees_writes_from_both_handles() {
        let shared = Rc::new(RefCell::new(Fifo::new()));
        let mut writer = Rc::clone(&shared);
        let mut reader = Rc::clone(&shared);

        assert_eq!(writer.write(b"abc").unwrap(), 3);
        assert_eq!(reader.read_size().unwrap(), 3);

        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_boxed_stream_forwards() {
        let mut boxed: Box<dyn ByteStream> = Box::new(Fifo::new());
        boxed.write(b"xy").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(boxed.peek(&mut buf).unwrap(), 2);
        assert_eq!(boxed.read_size().unwrap(), 2);
        assert!(boxed.error().is_none());
    }
}
