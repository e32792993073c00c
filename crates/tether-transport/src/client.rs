//! Outgoing connection state machine.

use std::io;

use tether_stream::{ByteStream, ReadStream, StreamError, StreamResult, WriteStream};
use tracing::{debug, warn};

use crate::state::{Notify, StateCallback};
use crate::sys::{Descriptor, Interest, RawSocket};
use crate::{Address, ClientState, Disposition, SocketError};

/// A non-blocking connecting socket.
///
/// Call [`update`](Self::update) regularly: it completes a pending
/// connect and notices when the peer hangs up. The client is also a
/// [`ByteStream`], so it can back a `BufferedStream` directly.
pub struct Client<D: RawSocket = Descriptor> {
    socket: Option<D>,
    state: ClientState,
    error: Option<StreamError>,
    close_lock: bool,
    notify: Notify<Self, ClientState>,
}

impl<D: RawSocket> Client<D> {
    pub fn new() -> Self {
        Self {
            socket: None,
            state: ClientState::Initial,
            error: None,
            close_lock: false,
            notify: Notify::new(),
        }
    }

    /// Creates a client and starts connecting. On immediate failure the
    /// socket is closed; inspect [`state`](Self::state) and
    /// [`error`](ByteStream::error).
    pub fn connect_to(address: &Address) -> Self {
        let mut client = Self::new();
        if let Err(e) = client.connect(address) {
            debug!(%address, error = %e, "connect failed");
            let _ = client.close();
        }
        client
    }

    /// Registers the state-change callback, replacing any previous one.
    pub fn on_state_changed(&mut self, callback: impl FnMut(&mut Self, ClientState) + 'static) {
        let callback: StateCallback<Self, ClientState> = Box::new(callback);
        self.notify.set(callback);
    }

    pub fn clear_on_state_changed(&mut self) {
        self.notify.clear();
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_failed(&self) -> bool {
        self.state == ClientState::Failed
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.socket.as_ref()?.local_addr().ok().flatten()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Starts a non-blocking connect.
    ///
    /// Allowed from `Initial` and `Disconnected`. An immediate success
    /// moves to `Connected`; an in-progress connect stays in `Connecting`
    /// until [`update`](Self::update) sees it complete.
    pub fn connect(&mut self, address: &Address) -> Result<(), SocketError> {
        if self.is_active() {
            return Err(SocketError::Busy);
        }
        if self.is_failed() {
            return Err(self.invalid("connect"));
        }

        self.set_state(ClientState::Connecting);
        if self.socket.is_none() {
            match D::open(address) {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => return Err(self.fail(e)),
            }
        }

        let result = match self.socket.as_ref() {
            Some(socket) => socket.connect(address),
            None => return Err(StreamError::NotConfigured.into()),
        };
        match result {
            Ok(()) => {
                debug!(%address, "connected");
                self.set_state(ClientState::Connected);
                Ok(())
            }
            Err(e) if D::classify(&e) == Disposition::Retry => {
                debug!(%address, "connect in progress");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Advances the state machine: completes a pending connect and
    /// detects hang-up.
    pub fn update(&mut self) -> Result<(), SocketError> {
        if self.is_failed() {
            return Err(self.sticky());
        }
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };

        if self.state == ClientState::Connecting {
            let readiness = match socket.poll(Interest::WRITE) {
                Ok(readiness) => readiness,
                Err(e) => return self.check_error(e).map(drop).map_err(Into::into),
            };
            if !readiness.writable && !readiness.error && !readiness.hangup {
                return Ok(());
            }
            match socket.take_error() {
                Ok(None) => self.set_state(ClientState::Connected),
                Ok(Some(e)) | Err(e) => return Err(self.fail(e)),
            }
        }

        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        let readiness = match socket.poll(Interest::READ) {
            Ok(readiness) => readiness,
            Err(e) => return self.check_error(e).map(drop).map_err(Into::into),
        };
        let eof = readiness.readable && matches!(socket.read_size(), Ok(0));
        if readiness.hangup || eof {
            debug!(state = %self.state, "peer hung up");
            self.set_state(ClientState::Disconnecting);
        } else if readiness.error {
            if let Ok(Some(e)) = socket.take_error() {
                self.check_error(e)?;
            }
        }
        Ok(())
    }

    /// Half-closes a connected socket, then closes it.
    pub fn shutdown(&mut self) -> Result<(), SocketError> {
        let mut result = Ok(());
        if self.state == ClientState::Connected {
            if let Some(socket) = self.socket.as_ref() {
                match socket.shutdown_write() {
                    Ok(()) => self.set_state(ClientState::Disconnecting),
                    Err(e) => result = self.check_error(e).map(drop).map_err(Into::into),
                }
            }
        }
        self.close()?;
        result
    }

    /// Closes the descriptor and moves to `Disconnected`.
    ///
    /// Safe to call repeatedly and from inside the state callback.
    pub fn close(&mut self) -> Result<(), SocketError> {
        if self.socket.is_none() || self.close_lock {
            return Ok(());
        }
        self.close_lock = true;
        self.socket = None;
        self.set_state(ClientState::Disconnected);
        self.close_lock = false;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn set_state(&mut self, state: ClientState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "client state changed");
        self.state = state;
        Notify::emit(self, Self::notify_slot, state);
    }

    fn notify_slot(&mut self) -> &mut Notify<Self, ClientState> {
        &mut self.notify
    }

    /// Maps an OS error onto the state machine. Retry and disconnect
    /// report zero bytes; anything else fails the socket.
    fn check_error(&mut self, err: io::Error) -> StreamResult {
        match D::classify(&err) {
            Disposition::Retry => Ok(0),
            Disposition::Disconnect => {
                debug!(error = %err, "connection dropped");
                self.set_state(ClientState::Disconnecting);
                Ok(0)
            }
            Disposition::Fatal => Err(self.record(err)),
        }
    }

    fn fail(&mut self, err: io::Error) -> SocketError {
        self.record(err).into()
    }

    fn record(&mut self, err: io::Error) -> StreamError {
        let err = StreamError::from(err);
        if self.error.is_none() {
            warn!(error = %err, "client failed");
            self.error = Some(err);
        }
        self.set_state(ClientState::Failed);
        self.sticky_stream()
    }

    fn sticky_stream(&self) -> StreamError {
        self.error.clone().unwrap_or(StreamError::NotConfigured)
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

    /// Runs a descriptor call. `Ok(None)` means no progress (retry or
    /// disconnect).
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

impl<D: RawSocket> Default for Client<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RawSocket + std::fmt::Debug> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("socket", &self.socket)
            .field("error", &self.error)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stream impl
// ---------------------------------------------------------------------------

impl<D: RawSocket> ReadStream for Client<D> {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult {
        let wanted = !buf.is_empty();
        match self.io(|s| s.read(buf))? {
            Some(0) if wanted => {
                self.set_state(ClientState::Disconnecting);
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

impl<D: RawSocket> WriteStream for Client<D> {
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

impl<D: RawSocket> ByteStream for Client<D> {}
