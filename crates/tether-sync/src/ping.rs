//! Ping/pong round-trip counter.
//!
//! Both ends of a connection attach a [`PingCounter`] with the same pair
//! of ids. Each side then runs its own chain:
//!
//! ```text
//! A: ping(1) ──►  B: pong(1) ──►  A: ping(2) ──►  B: pong(2) ...
//! ```
//!
//! A keeps exactly one ping in flight. Every pong that comes back is one
//! measured round trip, so the counter doubles as a liveness check and a
//! latency gauge.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_protocol::{Codec, Handler, Link, Listener, PacketId};
use tether_stream::ByteStream;
use tracing::{debug, trace, warn};

/// Ids used by a [`PingCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingConfig {
    pub ping_id: PacketId,
    pub pong_id: PacketId,
}

impl PingConfig {
    pub fn new(ping_id: PacketId, pong_id: PacketId) -> Self {
        Self { ping_id, pong_id }
    }

    /// Fixes reserved or clashing ids, logging each change.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.ping_id == 0 {
            warn!(default = defaults.ping_id, "ping id 0 is reserved, using default");
            self.ping_id = defaults.ping_id;
        }
        if self.pong_id == 0 || self.pong_id == self.ping_id {
            let pong_id = self.ping_id.wrapping_add(1).max(1);
            warn!(pong_id, "pong id must be nonzero and differ from the ping id");
            self.pong_id = pong_id;
        }
        self
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            ping_id: 1,
            pong_id: 2,
        }
    }
}

/// Body of both ping and pong frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPacket {
    pub counter: u64,
}

type PingCallback = Box<dyn FnMut(u64)>;

#[derive(Default)]
struct PingState {
    local_count: u64,
    remote_count: u64,
    sent_at: Option<Instant>,
    round_trips: u64,
    total_latency: Duration,
    on_ping: Option<PingCallback>,
}

impl PingState {
    fn restart(&mut self) {
        self.local_count = 1;
        self.remote_count = 0;
        self.sent_at = Some(Instant::now());
        self.round_trips = 0;
        self.total_latency = Duration::ZERO;
    }

    fn record_round_trip(&mut self) {
        let now = Instant::now();
        if let Some(sent_at) = self.sent_at.replace(now) {
            self.total_latency += now - sent_at;
        }
        self.round_trips += 1;
    }
}

/// Counts ping/pong round trips on a [`Handler`] and averages their
/// latency.
pub struct PingCounter {
    config: PingConfig,
    state: Rc<RefCell<PingState>>,
    attached: bool,
}

impl PingCounter {
    pub fn new(ping_id: PacketId, pong_id: PacketId) -> Self {
        Self::with_config(PingConfig::new(ping_id, pong_id))
    }

    pub fn with_config(config: PingConfig) -> Self {
        Self {
            config: config.validated(),
            state: Rc::new(RefCell::new(PingState::default())),
            attached: false,
        }
    }

    pub fn config(&self) -> PingConfig {
        self.config
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Pings started by this side, including the one in flight.
    pub fn count(&self) -> u64 {
        self.state.borrow().local_count
    }

    /// Pings answered for the peer.
    pub fn remote_count(&self) -> u64 {
        self.state.borrow().remote_count
    }

    /// Completed round trips since the last attach.
    pub fn round_trips(&self) -> u64 {
        self.state.borrow().round_trips
    }

    /// Average round-trip time, zero before the first pong.
    pub fn latency(&self) -> Duration {
        let state = self.state.borrow();
        match u32::try_from(state.round_trips) {
            Ok(0) => Duration::ZERO,
            Ok(n) => state.total_latency / n,
            Err(_) => state.total_latency.div_f64(state.round_trips as f64),
        }
    }

    /// Called after every completed round trip with the new count.
    pub fn on_ping(&mut self, callback: impl FnMut(u64) + 'static) {
        self.state.borrow_mut().on_ping = Some(Box::new(callback));
    }

    /// Registers the ping and pong listeners on `handler` and sends the
    /// first ping. Counters restart from scratch. A counter that is
    /// already attached is detached from `handler` first.
    ///
    /// Returns `false` if the first ping could not be sent. Both listeners
    /// are removed again in that case and the counter stays detached.
    pub fn attach<S, C>(&mut self, handler: &mut Handler<S, C>) -> bool
    where
        S: ByteStream + 'static,
        C: Codec,
    {
        self.detach(handler);
        let PingConfig { ping_id, pong_id } = self.config;

        let state = Rc::clone(&self.state);
        handler.listen(
            ping_id,
            Listener::new(move |ping: &PingPacket, link: &mut Link<S, C>| {
                let mut state = state.borrow_mut();
                if ping.counter != state.remote_count + 1 {
                    debug!(got = ping.counter, expected = state.remote_count + 1, "ping out of sequence");
                    return false;
                }
                if !link.send(pong_id, ping) {
                    return false;
                }
                state.remote_count += 1;
                true
            }),
        );

        let state = Rc::clone(&self.state);
        handler.listen(
            pong_id,
            Listener::new(move |pong: &PingPacket, link: &mut Link<S, C>| {
                let mut guard = state.borrow_mut();
                if pong.counter != guard.local_count {
                    debug!(got = pong.counter, expected = guard.local_count, "pong out of sequence");
                    return false;
                }
                let next = PingPacket {
                    counter: guard.local_count + 1,
                };
                if !link.send(ping_id, &next) {
                    return false;
                }
                guard.record_round_trip();
                guard.local_count += 1;
                trace!(count = guard.local_count, "round trip");

                let count = guard.local_count;
                let callback = guard.on_ping.take();
                drop(guard);
                if let Some(mut callback) = callback {
                    callback(count);
                    let mut guard = state.borrow_mut();
                    if guard.on_ping.is_none() {
                        guard.on_ping = Some(callback);
                    }
                }
                true
            }),
        );

        self.attached = true;
        if !handler.send(ping_id, &PingPacket { counter: 1 }) {
            debug!(ping_id, "first ping not sent, detaching");
            self.detach(handler);
            return false;
        }
        self.state.borrow_mut().restart();
        true
    }

    /// Removes both listeners from `handler`, which must be the one this
    /// counter was attached to.
    pub fn detach<S: ByteStream, C: Codec>(&mut self, handler: &mut Handler<S, C>) {
        if !std::mem::take(&mut self.attached) {
            return;
        }
        handler.unlisten(self.config.pong_id);
        handler.unlisten(self.config.ping_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_fixes_clashing_ids() {
        let config = PingConfig::new(5, 5).validated();
        assert_eq!(config.ping_id, 5);
        assert_eq!(config.pong_id, 6);

        let config = PingConfig::new(0, 0).validated();
        assert_eq!(config, PingConfig::default());
    }

    #[test]
    fn test_fresh_counter_reports_zero() {
        let counter = PingCounter::new(1, 2);
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.round_trips(), 0);
        assert_eq!(counter.latency(), Duration::ZERO);
        assert!(!counter.is_attached());
    }
}
