//! Fixed-capacity read-ahead / write-behind staging over another stream.
//!
//! ```text
//!              ,-- read_flush() --, ,---- read_size() ----,
//! read_buff   [ . . . . . . . . . |  unread (peek/read)   ] . . . ]
//!                                 |                        \       \
//!                             read_pos()          read_buff.len()  capacity
//!
//!              ,--- write_flush() ---, ,---- write_size() ----,
//! write_buff  [  pending bytes        ] . . . . . . . . . . . ]
//!                                    /                         \
//!                            write_pos()                     capacity
//! ```
//!
//! Both buffers share the same capacity and never grow past it. If the
//! caller stops draining the read side, `read_flush` pulls less and less
//! from the backing stream; that is the backpressure.

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{ByteStream, ReadStream, StreamError, StreamResult, WriteStream};

// ---------------------------------------------------------------------------
// BufferConfig
// ---------------------------------------------------------------------------

/// Sizing for a [`BufferedStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Capacity of each staging buffer, in bytes.
    pub capacity: usize,
}

impl BufferConfig {
    /// Smallest accepted capacity. Anything less could not hold a frame
    /// header plus a few body bytes.
    pub const MIN_CAPACITY: usize = 16;

    /// Default staging capacity (64 KiB).
    pub const DEFAULT_CAPACITY: usize = 64 * 1024;

    /// Creates a config with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Returns a copy with the capacity clamped to [`Self::MIN_CAPACITY`].
    pub fn validated(mut self) -> Self {
        if self.capacity < Self::MIN_CAPACITY {
            warn!(
                capacity = self.capacity,
                min = Self::MIN_CAPACITY,
                "buffer capacity too small, clamping"
            );
            self.capacity = Self::MIN_CAPACITY;
        }
        self
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// BufferedStream
// ---------------------------------------------------------------------------

/// Wraps a [`ByteStream`] with two fixed-capacity staging buffers.
///
/// Reads and writes never touch the backing stream directly: data moves
/// in only on [`read_flush`](ReadStream::read_flush) and out only on
/// [`write_flush`](WriteStream::write_flush).
#[derive(Debug)]
pub struct BufferedStream<S> {
    stream: Option<S>,
    capacity: usize,
    read_pos: usize,
    read_buff: Vec<u8>,
    write_buff: Vec<u8>,
}

impl<S: ByteStream> BufferedStream<S> {
    /// Creates a detached stream with `capacity` bytes per buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            stream: None,
            capacity,
            read_pos: 0,
            read_buff: Vec::with_capacity(capacity),
            write_buff: Vec::with_capacity(capacity),
        }
    }

    /// Creates a detached stream sized by `config` (after validation).
    pub fn with_config(config: BufferConfig) -> Self {
        Self::new(config.validated().capacity)
    }

    /// Creates a stream already attached to `stream`.
    pub fn attached(stream: S, config: BufferConfig) -> Self {
        let mut buffered = Self::with_config(config);
        buffered.stream = Some(stream);
        buffered
    }

    /// Rebinds to a new backing stream (or detaches with `None`).
    ///
    /// Both buffers are cleared; staged bytes are discarded. The previous
    /// backing stream is handed back.
    pub fn reset(&mut self, stream: Option<S>) -> Option<S> {
        self.read_pos = 0;
        self.read_buff.clear();
        self.write_buff.clear();
        std::mem::replace(&mut self.stream, stream)
    }

    /// `true` when no backing stream is attached.
    pub fn is_empty(&self) -> bool {
        self.stream.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Read cursor within the read buffer.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Moves the read cursor, clamped to the buffered length. Moving it
    /// backwards re-exposes already consumed bytes until the next flush.
    pub fn set_read_pos(&mut self, position: usize) -> usize {
        self.read_pos = position.min(self.read_buff.len());
        self.read_pos
    }

    /// Number of bytes staged for writing.
    pub fn write_pos(&self) -> usize {
        self.write_buff.len()
    }

    /// Truncates (or zero-extends) the pending write buffer.
    ///
    /// Fails with [`StreamError::NotConfigured`] when detached.
    pub fn set_write_pos(&mut self, position: usize) -> StreamResult {
        if self.is_empty() {
            return Err(StreamError::NotConfigured);
        }
        let position = position.min(self.capacity);
        self.write_buff.resize(position, 0);
        Ok(position)
    }

    /// The unread part of the read buffer.
    pub fn buffered(&self) -> &[u8] {
        &self.read_buff[self.read_pos..]
    }

    /// The bytes waiting for the next `write_flush`.
    pub fn pending(&self) -> &[u8] {
        &self.write_buff
    }
}

impl<S: ByteStream> ReadStream for BufferedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult {
        let count = self.peek(buf)?;
        self.read_pos += count;
        Ok(count)
    }

    fn peek(&mut self, buf: &mut [u8]) -> StreamResult {
        let unread = &self.read_buff[self.read_pos..];
        let count = buf.len().min(unread.len());
        buf[..count].copy_from_slice(&unread[..count]);
        Ok(count)
    }

    fn read_flush(&mut self) -> Result<(), StreamError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        self.read_buff.drain(..self.read_pos);
        self.read_pos = 0;

        let current = self.read_buff.len();
        let room = self.capacity - current;
        let count = stream.read_size()?.min(room);
        if count == 0 {
            return Ok(());
        }

        self.read_buff.resize(current + count, 0);
        match stream.read(&mut self.read_buff[current..]) {
            Ok(read) => {
                self.read_buff.truncate(current + read);
                trace!(read, buffered = self.read_buff.len(), "read flush");
                Ok(())
            }
            Err(e) => {
                self.read_buff.truncate(current);
                Err(e)
            }
        }
    }

    fn read_size(&mut self) -> StreamResult {
        Ok(self.read_buff.len() - self.read_pos)
    }

    fn read_error(&self) -> Option<StreamError> {
        self.error()
    }
}

impl<S: ByteStream> WriteStream for BufferedStream<S> {
    fn write(&mut self, buf: &[u8]) -> StreamResult {
        let count = buf.len().min(self.capacity - self.write_buff.len());
        self.write_buff.extend_from_slice(&buf[..count]);
        Ok(count)
    }

    fn write_flush(&mut self) -> Result<(), StreamError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if self.write_buff.is_empty() {
            return Ok(());
        }

        let written = stream.write(&self.write_buff)?;
        self.write_buff.drain(..written);
        trace!(written, pending = self.write_buff.len(), "write flush");
        Ok(())
    }

    fn write_size(&mut self) -> StreamResult {
        Ok(self.capacity - self.write_buff.len())
    }

    fn write_error(&self) -> Option<StreamError> {
        self.error()
    }
}

impl<S: ByteStream> ByteStream for BufferedStream<S> {
    fn error(&self) -> Option<StreamError> {
        self.stream.as_ref().and_then(|s| s.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Fifo;

    fn attached(capacity: usize) -> BufferedStream<Fifo> {
        let mut stream = BufferedStream::new(capacity);
        stream.reset(Some(Fifo::new()));
        stream
    }

    #[test]
    fn test_detached_flushes_are_noops() {
        let mut stream: BufferedStream<Fifo> = BufferedStream::new(32);
        assert!(stream.is_empty());
        assert!(stream.read_flush().is_ok());
        assert!(stream.write_flush().is_ok());
        assert_eq!(stream.error(), None);
        assert_eq!(stream.set_write_pos(4), Err(StreamError::NotConfigured));
    }

    #[test]
    fn test_write_is_bounded_by_capacity() {
        let mut stream = attached(16);
        assert_eq!(stream.write(&[1u8; 10]).unwrap(), 10);
        assert_eq!(stream.write_size().unwrap(), 6);
        assert_eq!(stream.write(&[2u8; 10]).unwrap(), 6);
        assert_eq!(stream.write_size().unwrap(), 0);
        assert_eq!(stream.write(&[3u8; 1]).unwrap(), 0);
    }

    #[test]
    fn test_write_flush_moves_bytes_to_backing() {
        let mut stream = attached(16);
        stream.write(b"hello").unwrap();
        stream.write_flush().unwrap();
        assert!(stream.pending().is_empty());

        let backing = stream.get_mut().unwrap();
        assert_eq!(backing.read_size().unwrap(), 5);
    }

    #[test]
    fn test_read_then_peek_after_flush() {
        let mut stream = attached(16);
        stream.get_mut().unwrap().write(b"abcdef").unwrap();
        assert_eq!(stream.read_size().unwrap(), 0);

        stream.read_flush().unwrap();
        assert_eq!(stream.read_size().unwrap(), 6);

        let mut buf = [0u8; 2];
        assert_eq!(stream.peek(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"cd");
        assert_eq!(stream.read_pos(), 4);
        assert_eq!(stream.buffered(), b"ef");
    }

    #[test]
    fn test_read_flush_compacts_consumed_prefix() {
        let mut stream = attached(16);
        stream.get_mut().unwrap().write(&[7u8; 16]).unwrap();
        stream.read_flush().unwrap();

        let mut buf = [0u8; 10];
        stream.read(&mut buf).unwrap();

        stream.get_mut().unwrap().write(&[9u8; 16]).unwrap();
        stream.read_flush().unwrap();

        assert_eq!(stream.read_pos(), 0);
        assert_eq!(stream.read_size().unwrap(), 16);
        assert_eq!(&stream.buffered()[..6], &[7u8; 6]);
        assert_eq!(&stream.buffered()[6..], &[9u8; 10]);
    }

    #[test]
    fn test_set_read_pos_is_clamped() {
        let mut stream = attached(16);
        stream.get_mut().unwrap().write(b"xyz").unwrap();
        stream.read_flush().unwrap();
        assert_eq!(stream.set_read_pos(100), 3);
        assert_eq!(stream.set_read_pos(1), 1);
        assert_eq!(stream.buffered(), b"yz");
    }

    #[test]
    fn test_reset_clears_buffers_and_returns_previous() {
        let mut stream = attached(16);
        stream.write(b"pending").unwrap();
        let previous = stream.reset(None);
        assert!(previous.is_some());
        assert!(stream.is_empty());
        assert!(stream.pending().is_empty());
        assert_eq!(stream.read_size().unwrap(), 0);
    }

    #[test]
    fn test_config_validation_clamps() {
        let config = BufferConfig::with_capacity(1).validated();
        assert_eq!(config.capacity, BufferConfig::MIN_CAPACITY);
        assert_eq!(BufferConfig::default().capacity, 64 * 1024);
    }
}
