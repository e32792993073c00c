use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tether::prelude::*;
use tether::sync::SyncServerClient;
use tracing::{info, warn};

const PING: PacketId = 1;
const PONG: PacketId = 2;
const CLOCK: PacketId = 3;

/// Stop after this many client round trips.
const ROUND_TRIPS: u64 = 200;
/// Give up after this many ticks (about ten seconds at 60 Hz).
const MAX_TICKS: u64 = 600;

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chat {
    text: String,
}

impl Packet for Chat {
    const ID: PacketId = 10;
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

struct Peer {
    ping: PingCounter,
    clock: SyncServerClient,
}

fn start_server(clock: Rc<RefCell<SyncServer>>) -> Result<PacketServer<BincodeCodec, Peer>, TetherError> {
    PacketServer::builder()
        .bind(Address::localhost(0))
        .build(move |id, session| {
            let handler = session.handler_mut();
            handler.listen_packet(move |chat: &Chat, link: &mut Link<_, BincodeCodec>| {
                info!(%id, text = %chat.text, "chat");
                link.send_packet(&Chat {
                    text: format!("welcome, {id}"),
                })
            });

            let mut ping = PingCounter::new(PING, PONG);
            if !ping.attach(handler) {
                warn!(%id, "first ping not sent");
            }
            let clock = clock.borrow_mut().attach(handler, CLOCK);
            Peer { ping, clock }
        })
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn Error>> {
    tether::init_tracing();

    let clock = Rc::new(RefCell::new(SyncServer::new()));
    clock.borrow_mut().on_sync(|quant, timestamp| {
        tracing::debug!(quant, ?timestamp, "all clients caught up");
    });

    let mut server = start_server(Rc::clone(&clock))?;
    let address = server.local_addr().ok_or("server has no local address")?;
    info!(%address, "server listening");

    let mut client = Session::new(Client::<tether::transport::Descriptor>::connect_to(&address), BincodeCodec);
    let handler = client.handler_mut();
    handler.listen_packet(|chat: &Chat, _: &mut Link<_, BincodeCodec>| {
        info!(text = %chat.text, "server says");
        true
    });
    let mut ping = PingCounter::new(PING, PONG);
    ping.attach(handler);
    let follower = SyncClient::attach(handler, CLOCK);
    client.send_packet(&Chat {
        text: "hello from the client".into(),
    });

    let mut ticks = TickScheduler::new(TickConfig::with_rate(TickConfig::DEFAULT_FRAME_RATE_HZ));
    while ping.round_trips() < ROUND_TRIPS {
        let Some(tick) = ticks.wait_for_tick() else {
            break;
        };
        if tick.tick > MAX_TICKS {
            warn!(round_trips = ping.round_trips(), "giving up");
            break;
        }

        server.poll()?;
        clock.borrow_mut().sync();
        for (id, session, peer) in server.sessions_mut() {
            if !peer.clock.flush(session.handler_mut()) {
                warn!(%id, "clock sync not sent");
            }
        }

        let connected = match client.stream_mut() {
            Some(socket) => {
                socket.update()?;
                socket.is_connected()
            }
            None => false,
        };
        if connected {
            client.update()?;
        }
    }

    info!(
        round_trips = ping.round_trips(),
        latency = ?ping.latency(),
        quant = follower.quant(),
        lower_quant = clock.borrow().lower_quant(),
        "client done"
    );
    for (id, _, peer) in server.sessions_mut() {
        info!(%id, round_trips = peer.ping.round_trips(), acked = peer.clock.quant(), "server peer");
    }
    info!(ticks = ticks.tick_count(), skipped = ticks.skipped(), "pacing");

    if let Some(socket) = client.stream_mut() {
        socket.shutdown()?;
    }
    server.shutdown()?;
    Ok(())
}
