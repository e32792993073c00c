//! Non-blocking socket state machines for Tether.
//!
//! Three state machines share one shape: a lifecycle enum, a polled
//! `update()`, an idempotent `close()` and a state-change callback.
//!
//! - [`Client`] connects out (`Initial → Connecting → Connected → ...`).
//! - [`Server`] binds, listens and accepts.
//! - [`ServerClient`] is one accepted connection.
//!
//! Client and server-client are [`ByteStream`](tether_stream::ByteStream)s.
//! Nothing here blocks: every call returns at once, and "nothing
//! happened yet" is a successful zero-byte result.
//!
//! The state machines are platform independent; the OS calls go through
//! [`RawSocket`], implemented by [`Descriptor`] for the build target.

mod address;
mod client;
mod error;
mod server;
mod server_client;
mod state;
mod sys;

pub use address::Address;
pub use client::Client;
pub use error::{Disposition, SocketError};
pub use server::{Server, ServerConfig, SharedClient};
pub use server_client::ServerClient;
pub use state::{ClientState, NewClientAction, ServerClientState, ServerState, StateCallback};
pub use sys::{Descriptor, Interest, RawSocket, Readiness};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique client IDs.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of an accepted connection, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a `ClientId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_display() {
        assert_eq!(ClientId::new(7).to_string(), "client-7");
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_client_id_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ClientId::new(1), "alice");
        map.insert(ClientId::new(2), "bob");
        assert_eq!(map[&ClientId::new(1)], "alice");
    }
}
