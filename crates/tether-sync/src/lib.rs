//! Packet-level helpers built on [`tether_protocol::Handler`].
//!
//! - [`PingCounter`]: a ping/pong chain that counts round trips and
//!   averages their latency.
//! - [`SyncServer`] / [`SyncClient`]: a quantized clock shared by one
//!   server and many clients.
//!
//! Both register ordinary listeners, so they coexist with application
//! packets on the same handler as long as the ids do not collide.

mod clock;
mod ping;

pub use clock::{SyncClient, SyncPacket, SyncServer, SyncServerClient};
pub use ping::{PingConfig, PingCounter, PingPacket};
