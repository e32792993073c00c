//! Quantized clock sync between one server and many clients.
//!
//! The server advances a *quant* counter on every [`SyncServer::sync`]
//! and stamps it with the milliseconds elapsed since the server was
//! created. Every connected client receives `(quant, timestamp)` and
//! echoes it back. The server keeps the lowest echo across all clients:
//! that is the newest state *every* client is known to have seen, and
//! [`SyncServer::on_sync`] fires whenever it moves.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_protocol::{Codec, Handler, Link, Listener, PacketId};
use tether_stream::ByteStream;
use tracing::{debug, trace};

/// Wire body of a sync frame, sent by the server and echoed by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub quant: u64,
    pub timestamp_ms: u64,
}

impl SyncPacket {
    pub fn timestamp(&self) -> Duration {
        Duration::from_millis(self.timestamp_ms)
    }
}

type SyncCallback = Box<dyn FnMut(u64, Duration)>;

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Per-connection state the server tracks.
#[derive(Debug, Default)]
struct Peer {
    acked: Cell<SyncPacket>,
    outgoing: Cell<Option<SyncPacket>>,
}

struct ServerState {
    base: Instant,
    current: SyncPacket,
    lower: SyncPacket,
    peers: Vec<Weak<Peer>>,
    on_sync: Option<SyncCallback>,
}

/// Drives the quant counter and tracks what every client acknowledged.
pub struct SyncServer {
    state: Rc<RefCell<ServerState>>,
}

impl Default for SyncServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncServer {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ServerState {
                base: Instant::now(),
                current: SyncPacket::default(),
                lower: SyncPacket::default(),
                peers: Vec::new(),
                on_sync: None,
            })),
        }
    }

    pub fn quant(&self) -> u64 {
        self.state.borrow().current.quant
    }

    pub fn timestamp(&self) -> Duration {
        self.state.borrow().current.timestamp()
    }

    /// Lowest quant acknowledged by every attached client.
    pub fn lower_quant(&self) -> u64 {
        self.state.borrow().lower.quant
    }

    pub fn lower_timestamp(&self) -> Duration {
        self.state.borrow().lower.timestamp()
    }

    pub fn client_count(&self) -> usize {
        self.state
            .borrow()
            .peers
            .iter()
            .filter(|peer| peer.strong_count() > 0)
            .count()
    }

    /// Called with `(lower_quant, lower_timestamp)` when the lowest
    /// acknowledged quant changes.
    pub fn on_sync(&mut self, callback: impl FnMut(u64, Duration) + 'static) {
        self.state.borrow_mut().on_sync = Some(Box::new(callback));
    }

    /// Advances the quant and queues the new state for every client.
    ///
    /// The lower bound is computed from the acknowledgements received so
    /// far, before this quant goes out. Queued packets are written by
    /// [`SyncServerClient::flush`].
    pub fn sync(&mut self) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let elapsed = state.base.elapsed().as_millis();
        state.current = SyncPacket {
            quant: state.current.quant + 1,
            timestamp_ms: u64::try_from(elapsed).unwrap_or(u64::MAX),
        };

        state.peers.retain(|peer| peer.strong_count() > 0);
        let mut lower_quant = state.current.quant;
        let mut lower_timestamp = state.current.timestamp_ms;
        for peer in state.peers.iter().filter_map(Weak::upgrade) {
            let acked = peer.acked.get();
            lower_quant = lower_quant.min(acked.quant);
            lower_timestamp = lower_timestamp.min(acked.timestamp_ms);
            peer.outgoing.set(Some(state.current));
        }
        state.lower.timestamp_ms = lower_timestamp;
        trace!(quant = state.current.quant, peers = state.peers.len(), "sync");

        if lower_quant == state.lower.quant {
            return;
        }
        state.lower.quant = lower_quant;
        let lower = state.lower;
        let callback = state.on_sync.take();
        drop(guard);

        if let Some(mut callback) = callback {
            callback(lower.quant, lower.timestamp());
            let mut state = self.state.borrow_mut();
            if state.on_sync.is_none() {
                state.on_sync = Some(callback);
            }
        }
    }

    /// Registers a client connection on `handler` under `packet_id` and
    /// sends it the current state.
    pub fn attach<S, C>(&mut self, handler: &mut Handler<S, C>, packet_id: PacketId) -> SyncServerClient
    where
        S: ByteStream + 'static,
        C: Codec,
    {
        let current = self.state.borrow().current;
        let peer = Rc::new(Peer {
            acked: Cell::new(current),
            outgoing: Cell::new(Some(current)),
        });

        let echo = Rc::downgrade(&peer);
        handler.listen(
            packet_id,
            Listener::new(move |packet: &SyncPacket, _: &mut Link<S, C>| {
                if let Some(peer) = echo.upgrade() {
                    peer.acked.set(*packet);
                }
                true
            }),
        );
        self.state.borrow_mut().peers.push(Rc::downgrade(&peer));
        debug!(packet_id, quant = current.quant, "sync client attached");

        let mut client = SyncServerClient {
            server: Rc::downgrade(&self.state),
            peer,
            packet_id,
        };
        client.flush(handler);
        client
    }
}

/// The server's view of one connected client.
///
/// Dropping it removes the client from the server's lower bound.
pub struct SyncServerClient {
    server: Weak<RefCell<ServerState>>,
    peer: Rc<Peer>,
    packet_id: PacketId,
}

impl SyncServerClient {
    /// Last quant this client echoed back.
    pub fn quant(&self) -> u64 {
        self.peer.acked.get().quant
    }

    pub fn timestamp(&self) -> Duration {
        self.peer.acked.get().timestamp()
    }

    /// `true` when a sync is waiting for [`flush`](Self::flush).
    pub fn is_pending(&self) -> bool {
        self.peer.outgoing.get().is_some()
    }

    /// Sends the queued sync, if any. Returns `false` if the send failed;
    /// the packet stays queued.
    pub fn flush<S: ByteStream, C: Codec>(&mut self, handler: &mut Handler<S, C>) -> bool {
        let Some(packet) = self.peer.outgoing.get() else {
            return true;
        };
        if !handler.send(self.packet_id, &packet) {
            return false;
        }
        self.peer.outgoing.set(None);
        true
    }

    /// Removes the echo listener from `handler`.
    pub fn detach<S: ByteStream, C: Codec>(self, handler: &mut Handler<S, C>) {
        handler.unlisten(self.packet_id);
    }
}

impl Drop for SyncServerClient {
    fn drop(&mut self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let mut state = server.borrow_mut();
        let peer = Rc::downgrade(&self.peer);
        state
            .peers
            .retain(|other| other.strong_count() > 0 && !other.ptr_eq(&peer));
        if state.peers.is_empty() {
            state.lower = SyncPacket::default();
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Follows the server's quant and echoes every sync back.
pub struct SyncClient {
    last: Rc<Cell<SyncPacket>>,
    packet_id: PacketId,
}

impl SyncClient {
    pub fn attach<S, C>(handler: &mut Handler<S, C>, packet_id: PacketId) -> Self
    where
        S: ByteStream + 'static,
        C: Codec,
    {
        let last = Rc::new(Cell::new(SyncPacket::default()));
        let seen = Rc::clone(&last);
        handler.listen(
            packet_id,
            Listener::new(move |packet: &SyncPacket, link: &mut Link<S, C>| {
                seen.set(*packet);
                link.send(packet_id, packet)
            }),
        );
        Self { last, packet_id }
    }

    pub fn quant(&self) -> u64 {
        self.last.get().quant
    }

    pub fn timestamp(&self) -> Duration {
        self.last.get().timestamp()
    }

    pub fn detach<S: ByteStream, C: Codec>(self, handler: &mut Handler<S, C>) {
        handler.unlisten(self.packet_id);
    }
}
