//! Packet framing for Tether.
//!
//! This crate turns a [`ByteStream`](tether_stream::ByteStream) into a
//! stream of typed packets:
//!
//! - **Header** ([`Header`], [`HEADER_SIZE`]): the fixed 8-byte frame
//!   prefix carrying the packet id and the body size.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`], [`BincodeCodec`]): how
//!   packet bodies are converted to/from bytes.
//! - **Handler** ([`Handler`], [`Link`], [`Listener`]): frames outgoing
//!   packets and dispatches incoming ones to per-id receivers.
//! - **Aggregation** ([`SendAggregator`], [`IdRange`]): lets a range of
//!   packet ids be held back and flushed as a group.
//! - **Errors** ([`ProtocolError`], [`HandlerError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → BufferedStream → Handler (frames → packets) → receivers
//! ```
//!
//! The handler never blocks. `receive()` dispatches every complete frame
//! it can see and leaves a partial one in the stream for the next call.

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod aggregator;
mod codec;
mod error;
mod handler;
mod header;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use aggregator::{BatchAggregator, IdRange, SendAggregator};
#[cfg(feature = "bincode")]
pub use codec::BincodeCodec;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{BoxError, HandlerError, ProtocolError};
pub use handler::{Handler, Link, Listener, Packet, Receiver};
pub use header::{HEADER_SIZE, Header, PacketId};
