//! In-memory loopback streams.

use std::cell::RefCell;
use std::rc::Rc;

use crate::{ByteStream, ReadStream, StreamError, StreamResult, WriteStream};

// ---------------------------------------------------------------------------
// Fifo
// ---------------------------------------------------------------------------

/// An unbounded loopback: whatever is written comes back out of `read`.
///
/// Consumed bytes are dropped once a read leaves them as more than half of
/// the buffer, and on every [`read_flush`](ReadStream::read_flush). A
/// rewind through [`set_read_pos`](Fifo::set_read_pos) can only reach bytes
/// that are still held. `Fifo` never fails.
#[derive(Debug, Default, Clone)]
pub struct Fifo {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Fifo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held, including already consumed ones.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.len() == self.read_pos
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn set_read_pos(&mut self, position: usize) -> usize {
        self.read_pos = position.min(self.buffer.len());
        self.read_pos
    }

    /// Drops all data, read or not.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }

    fn compact(&mut self) {
        if self.read_pos == self.buffer.len() {
            self.clear();
        } else if self.read_pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }
}

impl ReadStream for Fifo {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult {
        let count = self.peek(buf)?;
        self.read_pos += count;
        self.compact();
        Ok(count)
    }

    fn peek(&mut self, buf: &mut [u8]) -> StreamResult {
        let unread = &self.buffer[self.read_pos..];
        let count = buf.len().min(unread.len());
        buf[..count].copy_from_slice(&unread[..count]);
        Ok(count)
    }

    fn read_flush(&mut self) -> Result<(), StreamError> {
        self.buffer.drain(..self.read_pos);
        self.read_pos = 0;
        Ok(())
    }

    fn read_size(&mut self) -> StreamResult {
        Ok(self.buffer.len() - self.read_pos)
    }

    fn read_error(&self) -> Option<StreamError> {
        None
    }
}

impl WriteStream for Fifo {
    fn write(&mut self, buf: &[u8]) -> StreamResult {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn write_flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn write_size(&mut self) -> StreamResult {
        Ok(usize::MAX - self.buffer.len())
    }

    fn write_error(&self) -> Option<StreamError> {
        None
    }
}

impl ByteStream for Fifo {}

// ---------------------------------------------------------------------------
// Duplex
// ---------------------------------------------------------------------------

/// One end of an in-memory connection created by [`duplex`].
///
/// Writes land in the peer's inbox; reads drain this end's inbox.
#[derive(Debug, Clone)]
pub struct DuplexEnd {
    inbox: Rc<RefCell<Fifo>>,
    outbox: Rc<RefCell<Fifo>>,
}

/// Creates two connected in-memory endpoints.
///
/// ```rust
/// use tether_stream::{duplex, ReadStream, WriteStream};
///
/// let (mut a, mut b) = duplex();
/// a.write(b"hi").unwrap();
///
/// let mut buf = [0u8; 2];
/// assert_eq!(b.read(&mut buf).unwrap(), 2);
/// assert_eq!(&buf, b"hi");
/// ```
pub fn duplex() -> (DuplexEnd, DuplexEnd) {
    let left = Rc::new(RefCell::new(Fifo::new()));
    let right = Rc::new(RefCell::new(Fifo::new()));
    (
        DuplexEnd {
            inbox: Rc::clone(&left),
            outbox: Rc::clone(&right),
        },
        DuplexEnd {
            inbox: right,
            outbox: left,
        },
    )
}

impl DuplexEnd {
    /// Bytes written by the peer and not yet read here.
    pub fn incoming(&self) -> usize {
        let inbox = self.inbox.borrow();
        inbox.len() - inbox.read_pos()
    }
}

impl ReadStream for DuplexEnd {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult {
        self.inbox.borrow_mut().read(buf)
    }

    fn peek(&mut self, buf: &mut [u8]) -> StreamResult {
        self.inbox.borrow_mut().peek(buf)
    }

    fn read_flush(&mut self) -> Result<(), StreamError> {
        self.inbox.borrow_mut().read_flush()
    }

    fn read_size(&mut self) -> StreamResult {
        self.inbox.borrow_mut().read_size()
    }

    fn read_error(&self) -> Option<StreamError> {
        None
    }
}

impl WriteStream for DuplexEnd {
    fn write(&mut self, buf: &[u8]) -> StreamResult {
        self.outbox.borrow_mut().write(buf)
    }

    fn write_flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn write_size(&mut self) -> StreamResult {
        self.outbox.borrow_mut().write_size()
    }

    fn write_error(&self) -> Option<StreamError> {
        None
    }
}

impl ByteStream for DuplexEnd {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_loopback() {
        let mut fifo = Fifo::new();
        fifo.write(b"hello").unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(fifo.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(fifo.read_size().unwrap(), 2);
    }

    #[test]
    fn test_fifo_read_flush_compacts() {
        let mut fifo = Fifo::new();
        fifo.write(b"abcdef").unwrap();
        let mut buf = [0u8; 2];
        fifo.read(&mut buf).unwrap();
        assert_eq!(fifo.len(), 6);

        fifo.read_flush().unwrap();
        assert_eq!(fifo.len(), 4);
        assert_eq!(fifo.read_pos(), 0);
        assert_eq!(fifo.read_size().unwrap(), 4);
    }

    #[test]
    fn test_fifo_reads_compact_without_flush() {
        let mut fifo = Fifo::new();
        fifo.write(b"abcd").unwrap();
        let mut buf = [0u8; 3];
        fifo.read(&mut buf).unwrap();
        assert_eq!(fifo.len(), 1);
        assert_eq!(fifo.read_pos(), 0);

        fifo.read(&mut buf).unwrap();
        assert_eq!(&buf[..1], b"d");
        assert_eq!(fifo.len(), 0);
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_duplex_inbox_does_not_grow_while_drained() {
        let (mut a, mut b) = duplex();
        let mut buf = [0u8; 64];
        for _ in 0..100 {
            a.write(&[7u8; 64]).unwrap();
            assert_eq!(b.read(&mut buf).unwrap(), 64);
        }
        assert_eq!(b.incoming(), 0);
        assert_eq!(b.inbox.borrow().len(), 0);
    }

    #[test]
    fn test_fifo_write_flush_keeps_data() {
        let mut fifo = Fifo::new();
        fifo.write(b"abc").unwrap();
        fifo.write_flush().unwrap();
        assert_eq!(fifo.read_size().unwrap(), 3);
    }

    #[test]
    fn test_fifo_never_reports_errors() {
        let fifo = Fifo::new();
        assert_eq!(fifo.error(), None);
    }

    #[test]
    fn test_duplex_is_crossed() {
        let (mut a, mut b) = duplex();
        a.write(b"to-b").unwrap();
        b.write(b"to-a").unwrap();

        assert_eq!(a.incoming(), 4);
        assert_eq!(b.incoming(), 4);

        let mut buf = [0u8; 4];
        a.read(&mut buf).unwrap();
        assert_eq!(&buf, b"to-a");
        b.read(&mut buf).unwrap();
        assert_eq!(&buf, b"to-b");
        assert_eq!(a.read_size().unwrap(), 0);
    }
}
