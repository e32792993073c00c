//! Lifecycle states and change notification.

use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// ClientState
// ---------------------------------------------------------------------------

/// Lifecycle of an outgoing connection.
///
/// ```text
/// Initial → Connecting → Connected → Disconnecting → Disconnected
///                  \__________\____________\______→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Initial,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ClientState {
    /// `true` while the connection is in flight or established.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
            Self::Disconnected => "Disconnected",
            Self::Failed => "Failed",
        }
    }
}

// ---------------------------------------------------------------------------
// ServerState
// ---------------------------------------------------------------------------

/// Lifecycle of a listening socket.
///
/// ```text
/// Initial → Binding → Bound → Listening → Closing → Closed
///                 \_______\________\__________\____→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Initial,
    Binding,
    Bound,
    Listening,
    Closing,
    Closed,
    Failed,
}

impl ServerState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Binding | Self::Bound | Self::Listening)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::Binding => "Binding",
            Self::Bound => "Bound",
            Self::Listening => "Listening",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        }
    }
}

// ---------------------------------------------------------------------------
// ServerClientState
// ---------------------------------------------------------------------------

/// Lifecycle of a connection accepted by a [`Server`](crate::Server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerClientState {
    Connected,
    Closing,
    Closed,
    Failed,
}

impl ServerClientState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::Closing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

display_as_str!(ClientState, ServerState, ServerClientState);

// ---------------------------------------------------------------------------
// NewClientAction
// ---------------------------------------------------------------------------

/// What a server does with a pending incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewClientAction {
    /// Leave the connection queued; it is offered again next update.
    None,
    /// Accept it as a [`ServerClient`](crate::ServerClient).
    Accept,
    /// Accept and close immediately.
    Reject,
    /// Let the server decide. Currently the same as `Reject`.
    #[default]
    Auto,
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

/// Callback invoked once per state transition with the new state.
pub type StateCallback<T, S> = Box<dyn FnMut(&mut T, S)>;

/// State-change notification slot owned by a socket.
///
/// Transitions that happen while a callback is running (the callback
/// closes the socket, say) are queued and delivered in order after it
/// returns, so every transition is reported exactly once and callbacks
/// never nest.
pub(crate) struct Notify<T, S> {
    callback: Option<StateCallback<T, S>>,
    pending: VecDeque<S>,
    delivering: bool,
}

impl<T, S: Copy> Notify<T, S> {
    pub(crate) fn new() -> Self {
        Self {
            callback: None,
            pending: VecDeque::new(),
            delivering: false,
        }
    }

    pub(crate) fn set(&mut self, callback: StateCallback<T, S>) {
        self.callback = Some(callback);
    }

    pub(crate) fn clear(&mut self) {
        self.callback = None;
    }

    /// Queues `state` and, unless already delivering, runs the callback
    /// for everything queued. `slot` projects the owner onto its `Notify`.
    pub(crate) fn emit(owner: &mut T, slot: fn(&mut T) -> &mut Self, state: S) {
        let notify = slot(owner);
        notify.pending.push_back(state);
        if notify.delivering {
            return;
        }
        notify.delivering = true;

        loop {
            let notify = slot(owner);
            let Some(state) = notify.pending.pop_front() else {
                notify.delivering = false;
                break;
            };
            let Some(mut callback) = notify.callback.take() else {
                continue;
            };
            callback(owner, state);
            let notify = slot(owner);
            if notify.callback.is_none() {
                notify.callback = Some(callback);
            }
        }
    }
}

impl<T, S> fmt::Debug for Notify<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notify")
            .field("registered", &self.callback.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}
