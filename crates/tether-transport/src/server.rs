//! Listening socket state machine.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tether_stream::StreamError;
use tracing::{debug, info, warn};

use crate::state::{Notify, StateCallback};
use crate::sys::{Descriptor, Interest, RawSocket};
use crate::{Address, Disposition, NewClientAction, ServerClient, ServerClientState, ServerState, SocketError};

/// An accepted connection, shared between the server and whoever drives it.
pub type SharedClient<D = Descriptor> = Rc<RefCell<ServerClient<D>>>;

type NewClientCallback<D> = Box<dyn FnMut(&Server<D>) -> NewClientAction>;
type ClientChangedCallback<D> = Box<dyn FnMut(&SharedClient<D>, ServerClientState)>;

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Listener settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen backlog.
    pub backlog: i32,
    /// Set `TCP_NODELAY` on accepted TCP connections.
    pub nodelay: bool,
}

impl ServerConfig {
    pub fn validated(mut self) -> Self {
        if self.backlog < 1 {
            warn!(backlog = self.backlog, "backlog must be positive, using 1");
            self.backlog = 1;
        }
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: 128,
            nodelay: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A non-blocking listening socket and the clients it accepted.
///
/// Drive it with [`update`](Self::update): each call drops clients that
/// went inactive, offers pending connections to the `on_new_client`
/// policy and shuts down clients whose peer hung up.
pub struct Server<D: RawSocket = Descriptor> {
    socket: Option<D>,
    state: ServerState,
    error: Option<StreamError>,
    close_lock: bool,
    config: ServerConfig,
    address: Option<Address>,
    clients: Vec<SharedClient<D>>,
    notify: Notify<Self, ServerState>,
    on_new_client: Option<NewClientCallback<D>>,
    on_client_state_changed: Option<ClientChangedCallback<D>>,
}

impl<D: RawSocket> Server<D> {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            socket: None,
            state: ServerState::Initial,
            error: None,
            close_lock: false,
            config: config.validated(),
            address: None,
            clients: Vec::new(),
            notify: Notify::new(),
            on_new_client: None,
            on_client_state_changed: None,
        }
    }

    /// Creates a server and binds it. On failure the socket is closed;
    /// inspect [`state`](Self::state).
    pub fn bind_to(address: &Address) -> Self {
        let mut server = Self::new();
        if let Err(e) = server.bind(address) {
            debug!(%address, error = %e, "bind failed");
            let _ = server.close();
        }
        server
    }

    /// Binds and starts listening in one step.
    pub fn listen_on(address: &Address, config: ServerConfig) -> Result<Self, SocketError> {
        let mut server = Self::with_config(config);
        server.bind(address)?;
        server.listen()?;
        Ok(server)
    }

    pub fn on_state_changed(&mut self, callback: impl FnMut(&mut Self, ServerState) + 'static) {
        let callback: StateCallback<Self, ServerState> = Box::new(callback);
        self.notify.set(callback);
    }

    /// Sets the policy for pending connections. Without one, every
    /// connection is rejected.
    pub fn on_new_client(&mut self, callback: impl FnMut(&Self) -> NewClientAction + 'static) {
        self.on_new_client = Some(Box::new(callback));
    }

    /// Called with `Connected` when a client is accepted, then once per
    /// later transition of that client, in order. Transitions are
    /// collected while the client is used and delivered on the next
    /// [`update`](Self::update), `shutdown` or `close`.
    pub fn on_client_state_changed(
        &mut self,
        callback: impl FnMut(&SharedClient<D>, ServerClientState) + 'static,
    ) {
        self.on_client_state_changed = Some(Box::new(callback));
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_failed(&self) -> bool {
        self.state == ServerState::Failed
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clients(&self) -> &[SharedClient<D>] {
        &self.clients
    }

    /// The bound address. For TCP with port 0 this carries the port the
    /// OS picked.
    pub fn local_addr(&self) -> Option<Address> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok().flatten())
            .or_else(|| self.address.clone())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn bind(&mut self, address: &Address) -> Result<(), SocketError> {
        if self.is_active() {
            return Err(SocketError::Busy);
        }
        if self.is_failed() {
            return Err(self.invalid("bind"));
        }

        self.set_state(ServerState::Binding);
        if self.socket.is_none() {
            match D::open(address) {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => return Err(self.fail(e)),
            }
        }
        if let Some(Err(e)) = self.socket.as_ref().map(|s| s.bind(address)) {
            return Err(self.fail(e));
        }

        self.address = Some(address.clone());
        self.set_state(ServerState::Bound);
        Ok(())
    }

    pub fn listen(&mut self) -> Result<(), SocketError> {
        if self.state != ServerState::Bound || !self.clients.is_empty() {
            return Err(self.invalid("listen"));
        }
        let backlog = self.config.backlog;
        if let Some(Err(e)) = self.socket.as_ref().map(|s| s.listen(backlog)) {
            return Err(self.fail(e));
        }
        if let Some(address) = self.local_addr() {
            info!(%address, backlog, "listening");
        }
        self.set_state(ServerState::Listening);
        Ok(())
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when nothing was pending.
    pub fn accept(&mut self) -> Result<Option<SharedClient<D>>, SocketError> {
        if self.state != ServerState::Listening {
            return Err(self.invalid("accept"));
        }
        let result = match self.socket.as_ref() {
            Some(socket) => socket.accept(),
            None => return Err(StreamError::NotConfigured.into()),
        };
        let socket = match result {
            Ok(socket) => socket,
            Err(e) => return self.check_error(e).map(|()| None),
        };

        let client = Rc::new(RefCell::new(ServerClient::new(socket, self.config.nodelay)));
        let (id, state) = {
            let client = client.borrow();
            (client.id(), client.state())
        };
        debug!(%id, "accepted client");
        self.clients.push(Rc::clone(&client));
        self.client_changed(&client, state);
        Ok(Some(client))
    }

    /// Accepts one pending connection and closes it straight away.
    ///
    /// Returns `Ok(false)` when nothing was pending.
    pub fn reject(&mut self) -> Result<bool, SocketError> {
        if self.state != ServerState::Listening {
            return Err(self.invalid("reject"));
        }
        let result = match self.socket.as_ref() {
            Some(socket) => socket.accept(),
            None => return Err(StreamError::NotConfigured.into()),
        };
        match result {
            Ok(socket) => {
                drop(socket);
                debug!("rejected connection");
                Ok(true)
            }
            Err(e) => self.check_error(e).map(|()| false),
        }
    }

    /// One service pass; see the type docs.
    pub fn update(&mut self) -> Result<(), SocketError> {
        if self.is_failed() {
            return Err(self.sticky());
        }
        if self.state != ServerState::Listening {
            return Ok(());
        }

        self.prune_clients();
        self.serve_pending()?;
        self.serve_hangups();
        self.report_client_changes();
        Ok(())
    }

    /// Stops listening, shuts down every client, then closes.
    pub fn shutdown(&mut self) -> Result<(), SocketError> {
        if self.state == ServerState::Listening {
            self.set_state(ServerState::Closing);
            for client in &self.clients {
                if let Err(e) = client.borrow_mut().shutdown() {
                    debug!(error = %e, "client shutdown failed");
                }
            }
            self.report_client_changes();
        }
        self.close()
    }

    /// Closes every client, then the listener. Idempotent.
    pub fn close(&mut self) -> Result<(), SocketError> {
        if self.socket.is_none() || self.close_lock {
            return Ok(());
        }
        self.close_lock = true;
        for client in &self.clients {
            let mut client = client.borrow_mut();
            if let Err(e) = client.close() {
                debug!(id = %client.id(), error = %e, "client close failed");
            }
        }
        self.report_client_changes();
        self.clients.clear();
        self.socket = None;
        self.set_state(ServerState::Closed);
        self.close_lock = false;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Update steps
    // -----------------------------------------------------------------------

    fn prune_clients(&mut self) {
        let mut idx = 0;
        while idx < self.clients.len() {
            if self.clients[idx].borrow().is_active() {
                idx += 1;
                continue;
            }
            let client = self.clients.remove(idx);
            let transitions = {
                let mut client = client.borrow_mut();
                if let Err(e) = client.close() {
                    debug!(id = %client.id(), error = %e, "close of inactive client failed");
                }
                debug!(id = %client.id(), state = %client.state(), "dropping inactive client");
                client.take_transitions()
            };
            for state in transitions {
                self.client_changed(&client, state);
            }
        }
    }

    fn serve_pending(&mut self) -> Result<(), SocketError> {
        loop {
            let readiness = match self.socket.as_ref() {
                Some(socket) => socket.poll(Interest::READ),
                None => return Ok(()),
            };
            let readiness = match readiness {
                Ok(readiness) => readiness,
                Err(e) => return self.check_error(e),
            };
            if !readiness.readable {
                return Ok(());
            }

            let progressed = match self.ask_new_client() {
                NewClientAction::None => return Ok(()),
                NewClientAction::Accept => self.accept()?.is_some(),
                NewClientAction::Reject | NewClientAction::Auto => self.reject()?,
            };
            if !progressed || self.state != ServerState::Listening {
                return Ok(());
            }
        }
    }

    fn serve_hangups(&mut self) {
        for client in &self.clients {
            let mut client = client.borrow_mut();
            match client.poll_hangup() {
                Ok(true) => {
                    debug!(id = %client.id(), "client hung up");
                    if let Err(e) = client.shutdown() {
                        debug!(id = %client.id(), error = %e, "shutdown after hang-up failed");
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(id = %client.id(), error = %e, "client poll failed"),
            }
        }
    }

    fn ask_new_client(&mut self) -> NewClientAction {
        let Some(mut callback) = self.on_new_client.take() else {
            return NewClientAction::Auto;
        };
        let action = callback(self);
        if self.on_new_client.is_none() {
            self.on_new_client = Some(callback);
        }
        action
    }

    fn report_client_changes(&mut self) {
        for idx in 0..self.clients.len() {
            let client = Rc::clone(&self.clients[idx]);
            let transitions = client.borrow_mut().take_transitions();
            for state in transitions {
                self.client_changed(&client, state);
            }
        }
    }

    fn client_changed(&mut self, client: &SharedClient<D>, state: ServerClientState) {
        if let Some(callback) = self.on_client_state_changed.as_mut() {
            callback(client, state);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn set_state(&mut self, state: ServerState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "server state changed");
        self.state = state;
        Notify::emit(self, Self::notify_slot, state);
    }

    fn notify_slot(&mut self) -> &mut Notify<Self, ServerState> {
        &mut self.notify
    }

    /// Listener errors: retry-class errors (including an aborted pending
    /// connection) are ignored, the rest fail the server.
    fn check_error(&mut self, err: io::Error) -> Result<(), SocketError> {
        match D::classify(&err) {
            Disposition::Retry | Disposition::Disconnect => Ok(()),
            Disposition::Fatal => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: io::Error) -> SocketError {
        let err = StreamError::from(err);
        if self.error.is_none() {
            warn!(error = %err, "server failed");
            self.error = Some(err);
        }
        self.set_state(ServerState::Failed);
        self.sticky()
    }

    fn sticky(&self) -> SocketError {
        match &self.error {
            Some(err) => SocketError::Io(err.clone()),
            None => self.invalid("update"),
        }
    }

    fn invalid(&self, op: &'static str) -> SocketError {
        SocketError::InvalidState {
            op,
            state: self.state.as_str(),
        }
    }
}

impl<D: RawSocket> Default for Server<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RawSocket> std::fmt::Debug for Server<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("address", &self.address)
            .field("clients", &self.clients.len())
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.backlog, 128);
        assert!(config.nodelay);
    }

    #[test]
    fn test_config_validation() {
        let config = ServerConfig {
            backlog: 0,
            nodelay: false,
        }
        .validated();
        assert_eq!(config.backlog, 1);
    }

    #[test]
    fn test_listen_requires_bound() {
        let mut server: Server = Server::new();
        let err = server.listen().unwrap_err();
        assert!(matches!(err, SocketError::InvalidState { op: "listen", .. }));
        assert_eq!(server.state(), ServerState::Initial);
    }

    #[test]
    fn test_accept_requires_listening() {
        let mut server: Server = Server::new();
        assert!(server.accept().is_err());
        assert!(server.reject().is_err());
    }
}
