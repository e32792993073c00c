//! `PacketServer` builder and service loop.
//!
//! This ties the layers together: a listening [`Server`] accepts
//! connections, and every accepted connection gets its own [`Session`]
//! (buffered stream + packet handler). The application decides what a
//! session listens for through a factory called once per connection.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tether_protocol::{BincodeCodec, Codec};
use tether_transport::{Address, ClientId, NewClientAction, Server, ServerConfig, SharedClient};
use tracing::{debug, info, warn};

use crate::{Session, SessionConfig, TetherError};

/// Session type used for accepted connections.
pub type ServerSession<C> = Session<SharedClient, C>;

type SessionFactory<C, T> = Box<dyn FnMut(ClientId, &mut ServerSession<C>) -> T>;
type SessionClosed<T> = Box<dyn FnMut(ClientId, T)>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for a [`PacketServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketServerConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    /// Connections beyond this many are rejected. 0 means no limit.
    pub max_clients: usize,
}

impl Default for PacketServerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            max_clients: 1024,
        }
    }
}

impl PacketServerConfig {
    pub fn validated(self) -> Self {
        Self {
            server: self.server.validated(),
            session: self.session.validated(),
            max_clients: self.max_clients,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a [`PacketServer`].
///
/// # Example
///
/// ```rust,no_run
/// use tether::prelude::*;
///
/// let mut server = PacketServer::builder()
///     .bind(Address::localhost(7000))
///     .build(|id, session| {
///         session.handler_mut().listen(1, Listener::raw(|_, _| true));
///         id
///     })?;
/// loop {
///     server.poll()?;
/// }
/// # Ok::<(), TetherError>(())
/// ```
pub struct PacketServerBuilder<C = BincodeCodec> {
    address: Address,
    config: PacketServerConfig,
    codec: C,
}

impl PacketServerBuilder<BincodeCodec> {
    /// Creates a new builder with default settings, bound to an
    /// ephemeral loopback port.
    pub fn new() -> Self {
        Self {
            address: Address::localhost(0),
            config: PacketServerConfig::default(),
            codec: BincodeCodec,
        }
    }
}

impl Default for PacketServerBuilder<BincodeCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec + Clone> PacketServerBuilder<C> {
    /// Sets the address to listen on.
    pub fn bind(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    pub fn config(mut self, config: PacketServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the codec every session uses for packet bodies.
    pub fn codec<C2: Codec + Clone>(self, codec: C2) -> PacketServerBuilder<C2> {
        PacketServerBuilder {
            address: self.address,
            config: self.config,
            codec,
        }
    }

    /// Binds, listens and returns the running server.
    ///
    /// `factory` runs once per accepted connection. It registers the
    /// session's listeners and returns per-connection state `T`, kept
    /// next to the session until the connection closes.
    pub fn build<T, F>(self, factory: F) -> Result<PacketServer<C, T>, TetherError>
    where
        F: FnMut(ClientId, &mut ServerSession<C>) -> T + 'static,
    {
        let config = self.config.validated();
        let mut server = Server::listen_on(&self.address, config.server)?;

        let limit = config.max_clients;
        server.on_new_client(move |server| {
            if limit != 0 && server.clients().len() >= limit {
                debug!(limit, "client limit reached, rejecting");
                NewClientAction::Reject
            } else {
                NewClientAction::Accept
            }
        });

        info!(address = ?server.local_addr(), "packet server listening");
        Ok(PacketServer {
            server,
            config,
            codec: self.codec,
            peers: Vec::new(),
            factory: Box::new(factory),
            on_session_closed: None,
        })
    }
}

// ---------------------------------------------------------------------------
// PacketServer
// ---------------------------------------------------------------------------

struct Peer<C, T> {
    id: ClientId,
    client: SharedClient,
    session: ServerSession<C>,
    state: T,
}

/// A listening socket with one packet [`Session`] per accepted client.
///
/// Call [`poll`](Self::poll) once per loop iteration.
pub struct PacketServer<C, T> {
    server: Server,
    config: PacketServerConfig,
    codec: C,
    peers: Vec<Peer<C, T>>,
    factory: SessionFactory<C, T>,
    on_session_closed: Option<SessionClosed<T>>,
}

impl PacketServer<BincodeCodec, ()> {
    /// Creates a new builder.
    pub fn builder() -> PacketServerBuilder {
        PacketServerBuilder::new()
    }
}

impl<C: Codec + Clone, T> PacketServer<C, T> {
    pub fn local_addr(&self) -> Option<Address> {
        self.server.local_addr()
    }

    pub fn config(&self) -> &PacketServerConfig {
        &self.config
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// The listening socket, e.g. to replace the accept policy.
    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Called with the per-connection state when a session ends.
    pub fn on_session_closed(&mut self, callback: impl FnMut(ClientId, T) + 'static) {
        self.on_session_closed = Some(Box::new(callback));
    }

    /// Ids of the live sessions, in accept order.
    pub fn ids(&self) -> impl Iterator<Item = ClientId> {
        self.peers.iter().map(|peer| peer.id)
    }

    pub fn session(&self, id: ClientId) -> Option<(&ServerSession<C>, &T)> {
        self.peers
            .iter()
            .find(|peer| peer.id == id)
            .map(|peer| (&peer.session, &peer.state))
    }

    pub fn session_mut(&mut self, id: ClientId) -> Option<(&mut ServerSession<C>, &mut T)> {
        self.peers
            .iter_mut()
            .find(|peer| peer.id == id)
            .map(|peer| (&mut peer.session, &mut peer.state))
    }

    /// Every live session with its state, in accept order.
    pub fn sessions_mut(
        &mut self,
    ) -> impl Iterator<Item = (ClientId, &mut ServerSession<C>, &mut T)> {
        self.peers
            .iter_mut()
            .map(|peer| (peer.id, &mut peer.session, &mut peer.state))
    }

    /// One service pass.
    ///
    /// Accepts pending connections, drops sessions whose connection
    /// closed, then updates every remaining connection and session. A
    /// session that fails is shut down and dropped on the next pass.
    pub fn poll(&mut self) -> Result<(), TetherError> {
        self.server.update()?;
        self.adopt_clients();
        self.drop_closed();

        for peer in &mut self.peers {
            let socket = peer.client.borrow_mut().update();
            let result = match socket {
                Ok(()) => peer.session.update(),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(id = %peer.id, error = %e, "session failed, shutting down");
                if let Err(e) = peer.client.borrow_mut().shutdown() {
                    debug!(id = %peer.id, error = %e, "shutdown after failure failed");
                }
            }
        }
        Ok(())
    }

    /// Shuts down every connection and the listener.
    pub fn shutdown(&mut self) -> Result<(), TetherError> {
        for peer in &mut self.peers {
            // Last chance for queued replies.
            if let Some(stream) = peer.session.handler_mut().stream_mut() {
                if let Err(e) = tether_stream::WriteStream::write_flush(stream) {
                    debug!(id = %peer.id, error = %e, "final flush failed");
                }
            }
        }
        self.server.shutdown()?;
        self.drop_closed();
        info!("packet server shut down");
        Ok(())
    }

    fn adopt_clients(&mut self) {
        for client in self.server.clients() {
            let id = client.borrow().id();
            if !client.borrow().is_active() || self.peers.iter().any(|peer| peer.id == id) {
                continue;
            }
            let mut session =
                Session::with_config(Rc::clone(client), self.codec.clone(), self.config.session);
            let state = (self.factory)(id, &mut session);
            debug!(%id, "session opened");
            self.peers.push(Peer {
                id,
                client: Rc::clone(client),
                session,
                state,
            });
        }
    }

    fn drop_closed(&mut self) {
        let mut idx = 0;
        while idx < self.peers.len() {
            if self.peers[idx].client.borrow().is_active() {
                idx += 1;
                continue;
            }
            let peer = self.peers.remove(idx);
            debug!(id = %peer.id, "session closed");
            if let Some(callback) = self.on_session_closed.as_mut() {
                callback(peer.id, peer.state);
            }
        }
    }
}
