//! Packet framing and id-based dispatch over a [`ByteStream`].
//!
//! A [`Handler`] owns two halves:
//!
//! - a [`Link`]: the stream, the codec, the attached send aggregators
//!   and the sticky error. Everything needed to *send*.
//! - the listener tables: one decoder and one receiver per packet id.
//!
//! Receivers get `&mut Link` so they can answer a packet from inside the
//! dispatch loop (a ping answering with a pong, for example) while the
//! handler is still walking its tables.
//!
//! ## Failure model
//!
//! Framing errors are sticky. The first [`HandlerError`] is kept until
//! [`Handler::reset`]; later errors are logged and dropped. After a
//! receive-side error the stream position is unknown, so the connection
//! should be torn down.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Serialize, de::DeserializeOwned};
use tether_stream::{ByteStream, StreamError};
use tracing::{debug, trace, warn};

use crate::{
    Codec, HEADER_SIZE, Header, HandlerError, IdRange, PacketId, ProtocolError, SendAggregator,
};

/// A packet type with a fixed wire id.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use tether_protocol::Packet;
///
/// #[derive(Serialize, Deserialize)]
/// struct Chat {
///     text: String,
/// }
///
/// impl Packet for Chat {
///     const ID: u32 = 3;
/// }
/// ```
pub trait Packet: Serialize + DeserializeOwned + 'static {
    const ID: PacketId;
}

type SharedAggregator<S, C> = Rc<RefCell<dyn SendAggregator<S, C>>>;
type WeakAggregator<S, C> = Weak<RefCell<dyn SendAggregator<S, C>>>;

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// The sending half of a [`Handler`].
pub struct Link<S, C> {
    stream: Option<S>,
    codec: C,
    aggregators: Vec<WeakAggregator<S, C>>,
    last_aggregator: Option<WeakAggregator<S, C>>,
    error: Option<HandlerError>,
}

impl<S: ByteStream, C: Codec> Link<S, C> {
    fn new(stream: Option<S>, codec: C) -> Self {
        Self {
            stream,
            codec,
            aggregators: Vec::new(),
            last_aggregator: None,
            error: None,
        }
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// The first error hit since the last reset.
    pub fn error(&self) -> Option<HandlerError> {
        self.error
    }

    /// Encodes `packet` and sends it under `id`.
    ///
    /// Returns `true` once the frame is written or taken by an
    /// aggregator. `false` means nothing usable went out; see
    /// [`error`](Self::error).
    pub fn send<P: Serialize>(&mut self, id: PacketId, packet: &P) -> bool {
        match self.codec.encode(packet) {
            Ok(body) => self.send_bytes(id, &body),
            Err(e) => {
                warn!(id, error = %e, "packet encode failed");
                self.set_error(HandlerError::SendDataSerializeFailed)
            }
        }
    }

    /// Sends a packet using its [`Packet::ID`].
    pub fn send_packet<P: Packet>(&mut self, packet: &P) -> bool {
        self.send(P::ID, packet)
    }

    /// Sends an already encoded body, honoring attached aggregators.
    pub fn send_bytes(&mut self, id: PacketId, body: &[u8]) -> bool {
        if id == 0 {
            warn!("refusing to send reserved packet id 0");
            return false;
        }
        if self.send_aggregated(id, body) {
            return true;
        }
        self.write_frame(id, body)
    }

    /// Writes one frame straight to the stream, bypassing aggregators.
    ///
    /// The frame is written only when the stream can take all of it:
    /// `HEADER_SIZE + body.len()` must fit in `write_size()`.
    pub fn write_frame(&mut self, id: PacketId, body: &[u8]) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return self.set_error(HandlerError::SendHeaderStreamFailed);
        };
        let Ok(size) = u32::try_from(body.len()) else {
            return self.set_error(HandlerError::SendQueueFull);
        };

        let room = match stream.write_size() {
            Ok(room) => room,
            Err(e) => {
                debug!(id, error = %e, "write size unavailable");
                return self.set_error(HandlerError::SendHeaderStreamFailed);
            }
        };
        if HEADER_SIZE + body.len() > room {
            return self.set_error(HandlerError::SendQueueFull);
        }

        match stream.write(&Header::new(id, size).encode()) {
            Ok(HEADER_SIZE) => {}
            Ok(_) => return self.set_error(HandlerError::SendHeaderPartial),
            Err(_) => return self.set_error(HandlerError::SendHeaderStreamFailed),
        }
        if body.is_empty() {
            trace!(id, size, "frame sent");
            return true;
        }

        match stream.write(body) {
            Ok(written) if written == body.len() => {
                trace!(id, size, "frame sent");
                true
            }
            Ok(_) => self.set_error(HandlerError::SendDataPartial),
            Err(_) => self.set_error(HandlerError::SendDataStreamFailed),
        }
    }

    /// Records `error` unless one is already set. Always returns `false`
    /// so failure paths can `return self.set_error(..)`.
    fn set_error(&mut self, error: HandlerError) -> bool {
        match self.error {
            None => {
                debug!(%error, "handler failed");
                self.error = Some(error);
            }
            Some(first) => trace!(%first, dropped = %error, "handler already failed"),
        }
        false
    }

    // -- aggregation -------------------------------------------------------

    fn send_aggregated(&mut self, id: PacketId, body: &[u8]) -> bool {
        self.aggregators.retain(|agg| agg.strong_count() > 0);
        let hit = self
            .aggregators
            .iter()
            .filter_map(Weak::upgrade)
            .find(|agg| agg.borrow().range().contains(id));

        match hit {
            Some(agg) => {
                self.flush_last_aggregator(Some(&agg));
                agg.borrow_mut().process(id, body);
                true
            }
            None => {
                self.flush_last_aggregator(None);
                false
            }
        }
    }

    fn flush_last_aggregator(&mut self, next: Option<&SharedAggregator<S, C>>) {
        let last = self.last_aggregator.take().and_then(|weak| weak.upgrade());
        if let Some(last) = last {
            if next.is_none_or(|next| !Rc::ptr_eq(&last, next)) {
                last.borrow_mut().flush(self);
            }
        }
        self.last_aggregator = next.map(Rc::downgrade);
    }

    fn attach(&mut self, aggregator: SharedAggregator<S, C>) -> bool {
        self.aggregators.retain(|agg| agg.strong_count() > 0);
        let range = aggregator.borrow().range();
        let clash = self
            .aggregators
            .iter()
            .filter_map(Weak::upgrade)
            .any(|agg| agg.borrow().range().overlaps(&range));
        if clash {
            debug!(first = range.first, count = range.count, "aggregator range overlaps");
            return false;
        }

        let at = self
            .aggregators
            .iter()
            .filter_map(Weak::upgrade)
            .take_while(|agg| agg.borrow().range().first < range.first)
            .count();
        self.aggregators.insert(at, Rc::downgrade(&aggregator));
        true
    }

    fn reset_aggregators(&mut self) {
        self.last_aggregator = None;
        self.aggregators.retain(|agg| agg.strong_count() > 0);
        for agg in self.aggregators.iter().filter_map(Weak::upgrade) {
            agg.borrow_mut().reset();
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Type-erased receiver: gets the decoded packet as `&dyn Any`.
pub type Receiver<S, C> = Box<dyn FnMut(&dyn Any, &mut Link<S, C>) -> bool>;

/// Decodes a body into the slot it owns and exposes the result.
trait Prototype<C> {
    fn decode(&mut self, codec: &C, body: &[u8]) -> Result<(), ProtocolError>;
    fn value(&self) -> Option<&dyn Any>;
}

struct Typed<P>(Option<P>);

impl<C: Codec, P: DeserializeOwned + 'static> Prototype<C> for Typed<P> {
    fn decode(&mut self, codec: &C, body: &[u8]) -> Result<(), ProtocolError> {
        self.0 = Some(codec.decode(body)?);
        Ok(())
    }

    fn value(&self) -> Option<&dyn Any> {
        self.0.as_ref().map(|p| p as &dyn Any)
    }
}

struct Raw(Vec<u8>);

impl<C> Prototype<C> for Raw {
    fn decode(&mut self, _codec: &C, body: &[u8]) -> Result<(), ProtocolError> {
        self.0.clear();
        self.0.extend_from_slice(body);
        Ok(())
    }

    fn value(&self) -> Option<&dyn Any> {
        Some(&self.0)
    }
}

/// A decoder paired with the receiver that consumes its output.
pub struct Listener<S, C> {
    prototype: Box<dyn Prototype<C>>,
    receiver: Receiver<S, C>,
}

impl<S: ByteStream + 'static, C: Codec> Listener<S, C> {
    /// Decodes bodies as `P` and hands them to `receiver`.
    ///
    /// The receiver returns `false` to flag the packet as bad, which sets
    /// [`HandlerError::ReceiveReceiverFailed`].
    pub fn new<P, F>(mut receiver: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: FnMut(&P, &mut Link<S, C>) -> bool + 'static,
    {
        Self {
            prototype: Box::new(Typed::<P>(None)),
            receiver: Box::new(move |value: &dyn Any, link: &mut Link<S, C>| {
                match value.downcast_ref::<P>() {
                    Some(packet) => receiver(packet, link),
                    None => false,
                }
            }),
        }
    }

    /// Hands the undecoded body bytes to `receiver`.
    pub fn raw<F>(mut receiver: F) -> Self
    where
        F: FnMut(&[u8], &mut Link<S, C>) -> bool + 'static,
    {
        Self {
            prototype: Box::new(Raw(Vec::new())),
            receiver: Box::new(move |value: &dyn Any, link: &mut Link<S, C>| {
                match value.downcast_ref::<Vec<u8>>() {
                    Some(body) => receiver(body, link),
                    None => false,
                }
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Frames packets onto a stream and dispatches incoming frames by id.
pub struct Handler<S, C> {
    link: Link<S, C>,
    receivers: Vec<Option<Receiver<S, C>>>,
    prototypes: Vec<Option<Box<dyn Prototype<C>>>>,
    recv_header: Header,
    body: Vec<u8>,
    deserialize_error: Option<StreamError>,
    decode_error: Option<ProtocolError>,
}

impl<S: ByteStream, C: Codec + Default> Default for Handler<S, C> {
    fn default() -> Self {
        Self::new(None, C::default())
    }
}

impl<S: ByteStream, C: Codec> Handler<S, C> {
    pub fn new(stream: Option<S>, codec: C) -> Self {
        Self {
            link: Link::new(stream, codec),
            receivers: Vec::new(),
            prototypes: Vec::new(),
            recv_header: Header::default(),
            body: Vec::new(),
            deserialize_error: None,
            decode_error: None,
        }
    }

    /// Attaches a stream with the given codec.
    pub fn with_stream(stream: S, codec: C) -> Self {
        Self::new(Some(stream), codec)
    }

    /// Clears every error, drops any half-received frame, resets the
    /// aggregators and swaps the stream. Returns the previous stream.
    ///
    /// Listeners stay registered.
    pub fn reset(&mut self, stream: Option<S>) -> Option<S> {
        self.link.reset_aggregators();
        self.deserialize_error = None;
        self.decode_error = None;
        self.recv_header = Header::default();
        self.link.error = None;
        std::mem::replace(&mut self.link.stream, stream)
    }

    pub fn link(&self) -> &Link<S, C> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link<S, C> {
        &mut self.link
    }

    pub fn stream(&self) -> Option<&S> {
        self.link.stream()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.link.stream_mut()
    }

    pub fn error(&self) -> Option<HandlerError> {
        self.link.error
    }

    /// Header of the frame currently being received, if any.
    pub fn recv_header(&self) -> Option<Header> {
        self.recv_header.is_pending().then_some(self.recv_header)
    }

    /// Stream error hit while reading a frame body.
    pub fn deserialize_error(&self) -> Option<&StreamError> {
        self.deserialize_error.as_ref()
    }

    /// Codec error hit while decoding a frame body.
    pub fn decode_error(&self) -> Option<&ProtocolError> {
        self.decode_error.as_ref()
    }

    // -- listeners ---------------------------------------------------------

    /// Registers `listener` for `id`, replacing any previous one.
    ///
    /// Returns `false` for the reserved id 0.
    pub fn listen(&mut self, id: PacketId, listener: Listener<S, C>) -> bool {
        if id == 0 {
            warn!("refusing to listen on reserved packet id 0");
            return false;
        }
        let index = id as usize;
        if index >= self.receivers.len() {
            self.receivers.resize_with(index + 1, || None);
            self.prototypes.resize_with(index + 1, || None);
        }
        self.receivers[index] = Some(listener.receiver);
        self.prototypes[index] = Some(listener.prototype);
        true
    }

    /// Registers a typed listener under [`Packet::ID`].
    pub fn listen_packet<P, F>(&mut self, receiver: F) -> bool
    where
        S: 'static,
        P: Packet,
        F: FnMut(&P, &mut Link<S, C>) -> bool + 'static,
    {
        self.listen(P::ID, Listener::new::<P, F>(receiver))
    }

    /// Registers one listener per id in `range`, built by `factory`.
    ///
    /// Stops at the first rejected id and returns `false`.
    pub fn listen_range(
        &mut self,
        range: IdRange,
        mut factory: impl FnMut(PacketId) -> Listener<S, C>,
    ) -> bool {
        range.ids().all(|id| self.listen(id, factory(id)))
    }

    /// Drops the listener for `id`. Returns `false` if none was set.
    pub fn unlisten(&mut self, id: PacketId) -> bool {
        let index = id as usize;
        if index >= self.receivers.len() {
            return false;
        }
        let had = self.receivers[index].take().is_some();
        self.prototypes[index] = None;
        had
    }

    /// Drops every listener in `range`, highest id first.
    pub fn unlisten_range(&mut self, range: IdRange) {
        for id in range.ids().rev() {
            self.unlisten(id);
        }
    }

    /// `true` when something is registered for `id`.
    pub fn is_listening(&self, id: PacketId) -> bool {
        self.receivers
            .get(id as usize)
            .is_some_and(|receiver| receiver.is_some())
    }

    // -- aggregators -------------------------------------------------------

    /// Attaches `aggregator` for its [`IdRange`].
    ///
    /// Only a weak reference is kept: the aggregator detaches itself by
    /// being dropped. Fails if the range overlaps a live aggregator.
    pub fn attach_aggregator<A>(&mut self, aggregator: &Rc<RefCell<A>>) -> bool
    where
        A: SendAggregator<S, C> + 'static,
    {
        let shared: SharedAggregator<S, C> = aggregator.clone();
        self.link.attach(shared)
    }

    // -- sending -----------------------------------------------------------

    pub fn send<P: Serialize>(&mut self, id: PacketId, packet: &P) -> bool {
        self.link.send(id, packet)
    }

    pub fn send_packet<P: Packet>(&mut self, packet: &P) -> bool {
        self.link.send_packet(packet)
    }

    pub fn send_bytes(&mut self, id: PacketId, body: &[u8]) -> bool {
        self.link.send_bytes(id, body)
    }

    // -- receiving ---------------------------------------------------------

    /// Dispatches every complete frame currently readable.
    ///
    /// Returns `true` when the stream simply ran out of whole frames,
    /// and `false` once an error is recorded. A failed handler reads
    /// nothing more until [`reset`](Self::reset).
    pub fn receive(&mut self) -> bool {
        if self.link.stream.is_none() {
            warn!("receive on a handler without a stream");
            return false;
        }
        if self.link.error.is_some() {
            return false;
        }

        loop {
            if !self.recv_header.is_pending() {
                match self.read_header() {
                    Ok(Some(header)) => self.recv_header = header,
                    Ok(None) => return true,
                    Err(error) => return self.link.set_error(error),
                }
            }

            let header = self.recv_header;
            let size = header.size as usize;
            let Some(stream) = self.link.stream.as_mut() else {
                return false;
            };
            match stream.read_size() {
                Ok(available) if available < size => return true,
                Ok(_) => {}
                Err(_) => return self.link.set_error(HandlerError::ReceiveDataStreamFailed),
            }

            let index = header.id as usize;
            if index >= self.receivers.len() {
                return self.link.set_error(HandlerError::ReceiveHeaderBadId);
            }
            let Some(prototype) = self.prototypes[index].as_mut() else {
                return self.link.set_error(HandlerError::ReceivePacketUnknown);
            };

            self.body.resize(size, 0);
            match stream.read(&mut self.body) {
                Ok(read) if read == size => {}
                Ok(0) => return true,
                Ok(_) => return self.link.set_error(HandlerError::ReceiveDataPartial),
                Err(e) => {
                    self.deserialize_error = Some(e);
                    return self.link.set_error(HandlerError::ReceiveDataStreamFailed);
                }
            }

            if let Err(e) = prototype.decode(&self.link.codec, &self.body) {
                debug!(id = header.id, error = %e, "packet decode failed");
                self.decode_error = Some(e);
                return self.link.set_error(HandlerError::ReceiveDataDeserializeFailed);
            }

            let Some(receiver) = self.receivers[index].as_mut() else {
                return self.link.set_error(HandlerError::ReceiveNoReceiver);
            };
            let Some(value) = prototype.value() else {
                return self.link.set_error(HandlerError::ReceivePacketUnknown);
            };
            trace!(id = header.id, size = header.size, "dispatching packet");
            if !receiver(value, &mut self.link) {
                return self.link.set_error(HandlerError::ReceiveReceiverFailed);
            }

            self.recv_header = Header::default();
        }
    }

    fn read_header(&mut self) -> Result<Option<Header>, HandlerError> {
        let Some(stream) = self.link.stream.as_mut() else {
            return Ok(None);
        };
        match stream.read_size() {
            Ok(available) if available < HEADER_SIZE => return Ok(None),
            Ok(_) => {}
            Err(_) => return Err(HandlerError::ReceiveHeaderStreamFailed),
        }

        let mut raw = [0u8; HEADER_SIZE];
        match stream.read(&mut raw) {
            Ok(0) => return Ok(None),
            Ok(HEADER_SIZE) => {}
            Ok(_) => return Err(HandlerError::ReceiveHeaderPartial),
            Err(_) => return Err(HandlerError::ReceiveHeaderStreamFailed),
        }

        let header = Header::decode(&raw);
        if !header.is_pending() {
            return Err(HandlerError::ReceiveHeaderBadId);
        }
        trace!(id = header.id, size = header.size, "header received");
        Ok(Some(header))
    }
}
