//! Connections accepted by a [`Server`](crate::Server).

use std::io;

use tether_stream::{ByteStream, ReadStream, StreamError, StreamResult, WriteStream};
use tracing::{debug, warn};

use crate::state::{Notify, StateCallback};
use crate::sys::{Descriptor, Interest, RawSocket};
use crate::{ClientId, Disposition, ServerClientState, SocketError};

/// The server side of one accepted connection.
///
/// Starts out `Connected`. The owning server shuts it down when the peer
/// hangs up and drops it once it is no longer active.
pub struct ServerClient<D: RawSocket = Descriptor> {
    id: ClientId,
    socket: Option<D>,
    state: ServerClientState,
    error: Option<StreamError>,
    close_lock: bool,
    notify: Notify<Self, ServerClientState>,
    /// Transitions not yet reported to the owning server.
    unreported: Vec<ServerClientState>,
}

impl<D: RawSocket> ServerClient<D> {
    pub(crate) fn new(socket: D, nodelay: bool) -> Self {
        let id = ClientId::next();
        if let Err(e) = socket.set_blocking(false) {
            warn!(%id, error = %e, "failed to make accepted socket non-blocking");
        }
        if nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                debug!(%id, error = %e, "TCP_NODELAY not applied");
            }
        }
        Self {
            id,
            socket: Some(socket),
            state: ServerClientState::Connected,
            error: None,
            close_lock: false,
            notify: Notify::new(),
            unreported: Vec::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ServerClientState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_failed(&self) -> bool {
        self.state == ServerClientState::Failed
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn on_state_changed(
        &mut self,
        callback: impl FnMut(&mut Self, ServerClientState) + 'static,
    ) {
        let callback: StateCallback<Self, ServerClientState> = Box::new(callback);
        self.notify.set(callback);
    }

    /// Surfaces a pending socket error. Fails once the client has failed.
    pub fn update(&mut self) -> Result<(), SocketError> {
        if self.is_failed() {
            return Err(match &self.error {
                Some(err) => SocketError::Io(err.clone()),
                None => SocketError::InvalidState {
                    op: "update",
                    state: self.state.as_str(),
                },
            });
        }
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        match socket.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) | Err(e) => self.check_error(e).map(drop).map_err(Into::into),
        }
    }

    /// `true` when the peer has hung up or closed its write side.
    pub fn poll_hangup(&mut self) -> Result<bool, SocketError> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(false);
        };
        let readiness = match socket.poll(Interest::READ) {
            Ok(readiness) => readiness,
            Err(e) => {
                self.check_error(e)?;
                return Ok(false);
            }
        };
        let eof = readiness.readable && matches!(socket.read_size(), Ok(0));
        Ok(readiness.hangup || eof)
    }

    /// Half-closes the connection, then closes it.
    pub fn shutdown(&mut self) -> Result<(), SocketError> {
        let mut result = Ok(());
        if self.state == ServerClientState::Connected {
            if let Some(socket) = self.socket.as_ref() {
                match socket.shutdown_write() {
                    Ok(()) => self.set_state(ServerClientState::Closing),
                    Err(e) => result = self.check_error(e).map(drop).map_err(Into::into),
                }
            }
        }
        self.close()?;
        result
    }

    /// Closes the descriptor and moves to `Closed`. Idempotent.
    pub fn close(&mut self) -> Result<(), SocketError> {
        if self.socket.is_none() || self.close_lock {
            return Ok(());
        }
        self.close_lock = true;
        self.socket = None;
        self.set_state(ServerClientState::Closed);
        self.close_lock = false;
        Ok(())
    }

    fn set_state(&mut self, state: ServerClientState) {
        if self.state == state {
            return;
        }
        debug!(id = %self.id, from = %self.state, to = %state, "server client state changed");
        self.state = state;
        self.unreported.push(state);
        Notify::emit(self, Self::notify_slot, state);
    }

    /// Drains the transitions made since the last call, oldest first.
    pub(crate) fn take_transitions(&mut self) -> Vec<ServerClientState> {
        std::mem::take(&mut self.unreported)
    }

    fn notify_slot(&mut self) -> &mut Notify<Self, ServerClientState> {
        &mut self.notify
    }

    fn check_error(&mut self, err: io::Error) -> StreamResult {
        match D::classify(&err) {
            Disposition::Retry => Ok(0),
            Disposition::Disconnect => {
                debug!(id = %self.id, error = %err, "peer dropped connection");
                self.set_state(ServerClientState::Closing);
                Ok(0)
            }
            Disposition::Fatal => {
                let err = StreamError::from(err);
                if self.error.is_none() {
                    warn!(id = %self.id, error = %err, "server client failed");
                    self.error = Some(err);
                }
                self.set_state(ServerClientState::Failed);
                Err(self.error.clone().unwrap_or(StreamError::NotConfigured))
            }
        }
    }

    fn io<T>(&mut self, op: impl FnOnce(&D) -> io::Result<T>) -> Result<Option<T>, StreamError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(StreamError::NotConfigured);
        };
        match op(socket) {
            Ok(value) => Ok(Some(value)),
            Err(e) => self.check_error(e).map(|_| None),
        }
    }
}

impl<D: RawSocket + std::fmt::Debug> std::fmt::Debug for ServerClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("socket", &self.socket)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stream impl
// ---------------------------------------------------------------------------

impl<D: RawSocket> ReadStream for ServerClient<D> {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult {
        let wanted = !buf.is_empty();
        match self.io(|s| s.read(buf))? {
            Some(0) if wanted => {
                self.set_state(ServerClientState::Closing);
                Ok(0)
            }
            Some(n) => Ok(n),
            None => Ok(0),
        }
    }

    fn peek(&mut self, buf: &mut [u8]) -> StreamResult {
        Ok(self.io(|s| s.peek(buf))?.unwrap_or(0))
    }

    fn read_flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn read_size(&mut self) -> StreamResult {
        Ok(self.io(|s| s.read_size())?.unwrap_or(0))
    }

    fn read_error(&self) -> Option<StreamError> {
        self.error.clone()
    }
}

impl<D: RawSocket> WriteStream for ServerClient<D> {
    fn write(&mut self, buf: &[u8]) -> StreamResult {
        Ok(self.io(|s| s.write(buf))?.unwrap_or(0))
    }

    fn write_flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn write_size(&mut self) -> StreamResult {
        if self.socket.is_none() {
            return Err(StreamError::NotConfigured);
        }
        Ok(usize::MAX)
    }

    fn write_error(&self) -> Option<StreamError> {
        self.error.clone()
    }
}

impl<D: RawSocket> ByteStream for ServerClient<D> {}
