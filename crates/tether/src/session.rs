//! A packet handler bound to one connection.

use serde::{Deserialize, Serialize};
use tether_protocol::{Codec, Handler, Packet, PacketId};
use tether_stream::{BufferConfig, BufferedStream, ByteStream, ReadStream, WriteStream};
use tracing::trace;

use crate::TetherError;

/// Per-connection settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Staging buffers between the socket and the handler.
    pub buffer: BufferConfig,
}

impl SessionConfig {
    pub fn validated(self) -> Self {
        Self {
            buffer: self.buffer.validated(),
        }
    }
}

/// A connection plus the packet handler speaking over it.
///
/// The handler reads and writes through a [`BufferedStream`], so a frame
/// is only ever handed to the socket whole, and a frame is only decoded
/// once all of it has arrived.
///
/// Call [`update`](Self::update) once per loop iteration after the
/// underlying socket is connected.
pub struct Session<S, C> {
    handler: Handler<BufferedStream<S>, C>,
}

impl<S: ByteStream, C: Codec> Session<S, C> {
    pub fn new(stream: S, codec: C) -> Self {
        Self::with_config(stream, codec, SessionConfig::default())
    }

    pub fn with_config(stream: S, codec: C, config: SessionConfig) -> Self {
        let config = config.validated();
        let buffered = BufferedStream::attached(stream, config.buffer);
        Self {
            handler: Handler::with_stream(buffered, codec),
        }
    }

    pub fn handler(&self) -> &Handler<BufferedStream<S>, C> {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut Handler<BufferedStream<S>, C> {
        &mut self.handler
    }

    /// The connection itself.
    pub fn stream(&self) -> Option<&S> {
        self.handler.stream().and_then(BufferedStream::get_ref)
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.handler.stream_mut().and_then(BufferedStream::get_mut)
    }

    pub fn send<P: Serialize>(&mut self, id: PacketId, packet: &P) -> bool {
        self.handler.send(id, packet)
    }

    pub fn send_packet<P: Packet>(&mut self, packet: &P) -> bool {
        self.handler.send_packet(packet)
    }

    /// One service pass: pull bytes from the connection, dispatch every
    /// complete packet, push queued bytes back out.
    ///
    /// Queued output is flushed even when dispatch failed, so replies
    /// produced before the failure still go out. The handler's sticky
    /// error is then reported on this and every later call.
    pub fn update(&mut self) -> Result<(), TetherError> {
        if let Some(stream) = self.handler.stream_mut() {
            stream.read_flush()?;
        }

        let dispatched = self.handler.receive();

        if let Some(stream) = self.handler.stream_mut() {
            stream.write_flush()?;
            trace!(
                dispatched,
                buffered = stream.buffered().len(),
                pending = stream.pending().len(),
                "session updated"
            );
        }

        match self.handler.error() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Bytes still waiting to reach the connection.
    pub fn pending_output(&self) -> usize {
        self.handler.stream().map_or(0, |stream| stream.pending().len())
    }

    /// Detaches and returns the connection. Buffered bytes are dropped.
    pub fn into_stream(mut self) -> Option<S> {
        self.handler.reset(None).and_then(|mut buffered| buffered.reset(None))
    }
}
