//! # Tether
//!
//! Non-blocking packet networking over TCP and Unix domain sockets.
//!
//! Tether is built in layers, each its own crate and re-exported here:
//!
//! - [`stream`]: byte stream traits and the [`BufferedStream`] adapter.
//! - [`transport`]: non-blocking client, server and accepted-client
//!   socket state machines.
//! - [`protocol`]: the packet [`Handler`], framing every packet with an
//!   8-byte `(id, size)` header and dispatching it by id.
//! - [`sync`]: ready-made packet services ([`PingCounter`], clock sync).
//! - [`tick`]: a fixed-rate loop pacer for driving everything above.
//!
//! This crate adds [`Session`], a handler bound to one connection, and
//! [`PacketServer`], which runs one session per accepted client.
//!
//! Nothing blocks and nothing spawns threads. A program owns one loop and
//! polls every object in it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use tether::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Hello {
//!     name: String,
//! }
//!
//! impl Packet for Hello {
//!     const ID: PacketId = 10;
//! }
//!
//! let mut server = PacketServer::builder()
//!     .bind(Address::localhost(7000))
//!     .build(|id, session| {
//!         session.handler_mut().listen_packet(move |hello: &Hello, _| {
//!             tracing::info!(%id, name = %hello.name, "hello");
//!             true
//!         });
//!     })?;
//!
//! loop {
//!     server.poll()?;
//! }
//! # Ok::<(), TetherError>(())
//! ```

mod error;
mod server;
mod session;

pub use error::TetherError;
pub use server::{PacketServer, PacketServerBuilder, PacketServerConfig, ServerSession};
pub use session::{Session, SessionConfig};

pub use tether_protocol as protocol;
pub use tether_stream as stream;
pub use tether_sync as sync;
pub use tether_tick as tick;
pub use tether_transport as transport;

pub use tether_protocol::{Handler, Packet, PacketId};
pub use tether_stream::BufferedStream;
pub use tether_sync::PingCounter;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Installs a `tracing` subscriber printing to stderr.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Does nothing
/// if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::{
        PacketServer, PacketServerBuilder, PacketServerConfig, ServerSession, Session,
        SessionConfig, TetherError, init_tracing,
    };
    pub use tether_protocol::{
        BatchAggregator, BincodeCodec, Codec, Handler, HandlerError, IdRange, JsonCodec, Link,
        Listener, Packet, PacketId, SendAggregator,
    };
    pub use tether_stream::{BufferConfig, BufferedStream, ByteStream, ReadStream, WriteStream};
    pub use tether_sync::{PingConfig, PingCounter, SyncClient, SyncServer};
    pub use tether_tick::{TickConfig, TickInfo, TickScheduler};
    pub use tether_transport::{
        Address, Client, ClientId, ClientState, NewClientAction, Server, ServerConfig,
        SharedClient,
    };
}
