//! A `PacketServer` and client sessions over real loopback sockets.
//!
//! Everything runs on the test thread: `pump` polls the server and every
//! client session in turn until a condition holds.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether::prelude::*;

type ClientSession<C> = Session<Client, C>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    from: String,
    text: String,
}

impl Packet for Chat {
    const ID: PacketId = 10;
}

// =========================================================================
// Helpers
// =========================================================================

fn connect<C: Codec>(address: &Address, codec: C) -> ClientSession<C> {
    Session::new(Client::connect_to(address), codec)
}

fn is_connected<C: Codec>(session: &ClientSession<C>) -> bool {
    session.stream().is_some_and(Client::is_connected)
}

/// Drives the client socket, then its session once connected.
fn step_client<C: Codec>(session: &mut ClientSession<C>) {
    let connected = match session.stream_mut() {
        Some(client) => {
            let _ = client.update();
            client.is_connected()
        }
        None => false,
    };
    if connected {
        session.update().expect("client session");
    }
}

fn pump<C: Codec + Clone, T>(
    server: &mut PacketServer<C, T>,
    clients: &mut [&mut ClientSession<C>],
    mut done: impl FnMut(&PacketServer<C, T>, &[&mut ClientSession<C>]) -> bool,
) {
    for _ in 0..5000 {
        server.poll().expect("server poll");
        for client in clients.iter_mut() {
            step_client(client);
        }
        if done(server, clients) {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached with {} sessions", server.len());
}

// =========================================================================
// Ping
// =========================================================================

#[test]
fn test_ping_round_trips_both_ways() {
    let mut server = PacketServer::builder()
        .build(|_, session| {
            let mut counter = PingCounter::new(1, 2);
            assert!(counter.attach(session.handler_mut()));
            counter
        })
        .expect("listen on loopback");
    let address = server.local_addr().expect("bound address");

    // The server pings as soon as it accepts, so listen before connecting.
    // The first ping waits in the session buffer until then.
    let mut client = connect(&address, BincodeCodec);
    let mut counter = PingCounter::new(1, 2);
    assert!(counter.attach(client.handler_mut()));

    // One ping is in flight per side, so the count grows by at most one
    // per client update and stops exactly at ROUNDS.
    const ROUNDS: u64 = 20;
    pump(&mut server, &mut [&mut client], |_, _| counter.round_trips() == ROUNDS);
    assert_eq!(counter.round_trips(), ROUNDS);
    assert_eq!(counter.count(), ROUNDS + 1);

    let id = server.ids().next().expect("one session");
    let (session, remote) = server.session(id).expect("session by id");
    assert!(session.handler().error().is_none());
    // The server has not polled since ping ROUNDS + 1 went out.
    assert_eq!(remote.remote_count(), ROUNDS);
    assert!(remote.round_trips() > 0);
    assert!(remote.round_trips() <= counter.remote_count());
    assert!(counter.latency() > Duration::ZERO);
}

// =========================================================================
// Typed messages
// =========================================================================

#[test]
fn test_chat_echo_over_json() {
    let mut server = PacketServer::builder()
        .codec(JsonCodec)
        .build(|id, session| {
            session
                .handler_mut()
                .listen_packet(move |chat: &Chat, link: &mut Link<_, JsonCodec>| {
                    link.send_packet(&Chat {
                        from: id.to_string(),
                        text: chat.text.to_uppercase(),
                    })
                });
        })
        .expect("listen on loopback");
    let address = server.local_addr().expect("bound address");

    let mut client = connect(&address, JsonCodec);
    let received = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&received);
    client.handler_mut().listen_packet(move |chat: &Chat, _: &mut Link<_, JsonCodec>| {
        log.borrow_mut().push(chat.clone());
        true
    });

    pump(&mut server, &mut [&mut client], |s, c| is_connected(c[0]) && s.len() == 1);
    assert!(client.send_packet(&Chat {
        from: "me".into(),
        text: "hello".into(),
    }));
    assert!(client.send_packet(&Chat {
        from: "me".into(),
        text: "again".into(),
    }));

    pump(&mut server, &mut [&mut client], |_, _| received.borrow().len() == 2);
    let texts: Vec<_> = received.borrow().iter().map(|c| c.text.clone()).collect();
    assert_eq!(texts, ["HELLO", "AGAIN"]);
    assert!(received.borrow()[0].from.starts_with("client-"));
}

// =========================================================================
// Lifecycle
// =========================================================================

#[test]
fn test_client_limit_rejects_extra_connections() {
    let config = PacketServerConfig {
        max_clients: 1,
        ..PacketServerConfig::default()
    };
    let mut server = PacketServer::builder()
        .config(config)
        .build(|id, _| id)
        .expect("listen on loopback");
    let address = server.local_addr().expect("bound address");

    let mut first = connect(&address, BincodeCodec);
    pump(&mut server, &mut [&mut first], |s, c| is_connected(c[0]) && s.len() == 1);

    // The kernel completes the handshake; the server then drops it.
    let mut second = connect(&address, BincodeCodec);
    pump(&mut server, &mut [&mut first, &mut second], |_, c| {
        c[1].stream().map(Client::state) == Some(ClientState::Disconnecting)
    });
    assert_eq!(server.len(), 1);
}

#[test]
fn test_closed_session_reports_state() {
    let mut server = PacketServer::builder()
        .build(|id, _| id.into_inner())
        .expect("listen on loopback");
    let address = server.local_addr().expect("bound address");

    let closed = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&closed);
    server.on_session_closed(move |id, state| log.borrow_mut().push((id, state)));

    let mut client = connect(&address, BincodeCodec);
    pump(&mut server, &mut [&mut client], |s, c| is_connected(c[0]) && s.len() == 1);
    let id = server.ids().next().expect("one session");

    client.stream_mut().expect("client socket").shutdown().expect("shutdown");
    pump(&mut server, &mut [], |s, _| s.is_empty());
    assert_eq!(*closed.borrow(), [(id, id.into_inner())]);
}

#[test]
fn test_bad_frame_closes_only_that_session() {
    let mut server = PacketServer::builder()
        .build(|id, session| {
            session.handler_mut().listen(1, Listener::raw(|_, _| true));
            id
        })
        .expect("listen on loopback");
    let address = server.local_addr().expect("bound address");

    let mut good = connect(&address, BincodeCodec);
    let mut bad = connect(&address, BincodeCodec);
    pump(&mut server, &mut [&mut good, &mut bad], |s, c| {
        c.iter().all(|c| is_connected(c)) && s.len() == 2
    });

    // No listener is registered for 99.
    assert!(bad.send(99, &0u8));
    bad.update().expect("flush bad frame");
    assert!(good.send(1, &0u8));
    pump(&mut server, &mut [&mut good], |s, _| s.len() == 1);
    assert!(good.handler().error().is_none());
}

#[test]
fn test_shutdown_closes_clients() {
    let mut server = PacketServer::builder()
        .build(|id, _| id)
        .expect("listen on loopback");
    let address = server.local_addr().expect("bound address");

    let mut client = connect(&address, BincodeCodec);
    pump(&mut server, &mut [&mut client], |s, c| is_connected(c[0]) && s.len() == 1);

    server.shutdown().expect("shutdown");
    assert!(server.is_empty());
    assert!(!server.server().is_open());

    for _ in 0..2000 {
        if let Some(socket) = client.stream_mut() {
            let _ = socket.update();
            if socket.state() != ClientState::Connected {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(client.stream().map(Client::state), Some(ClientState::Disconnecting));
}

#[test]
fn test_shutdown_flushes_queued_packets() {
    let mut server = PacketServer::builder()
        .build(|id, _| id)
        .expect("listen on loopback");
    let address = server.local_addr().expect("bound address");

    let mut client = connect(&address, BincodeCodec);
    let received = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&received);
    client.handler_mut().listen_packet(move |chat: &Chat, _: &mut Link<_, BincodeCodec>| {
        log.borrow_mut().push(chat.text.clone());
        true
    });
    pump(&mut server, &mut [&mut client], |s, c| is_connected(c[0]) && s.len() == 1);

    let id = server.ids().next().expect("one session");
    let (session, _) = server.session_mut(id).expect("session by id");
    assert!(session.send_packet(&Chat {
        from: "server".into(),
        text: "bye".into(),
    }));
    server.shutdown().expect("shutdown");

    // Only the session is driven here, so the reply is read even after
    // the peer has hung up.
    for _ in 0..2000 {
        client.update().expect("client session");
        if !received.borrow().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(*received.borrow(), ["bye"]);
}

// =========================================================================
// Config
// =========================================================================

#[test]
fn test_config_reads_partial_json() {
    let config: PacketServerConfig =
        serde_json::from_str(r#"{"max_clients": 4, "session": {"buffer": {"capacity": 8}}}"#)
            .expect("valid config");
    assert_eq!(config.max_clients, 4);
    assert_eq!(config.server, ServerConfig::default());

    let config = config.validated();
    assert_eq!(config.session.buffer, BufferConfig::with_capacity(BufferConfig::MIN_CAPACITY));
}
