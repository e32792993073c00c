//! Socket state machines over real loopback connections.
//!
//! Both ends run on the test thread; `pump` alternates their `update()`
//! calls until a condition holds.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tether_stream::{ByteStream, ReadStream, WriteStream};
use tether_transport::{
    Address, Client, ClientState, NewClientAction, Server, ServerClientState, ServerConfig,
    ServerState, SharedClient,
};

// =========================================================================
// Helpers
// =========================================================================

fn listening_server(action: NewClientAction) -> (Server, Address) {
    let mut server = Server::listen_on(&Address::localhost(0), ServerConfig::default())
        .expect("listen on loopback");
    server.on_new_client(move |_| action);
    let address = server.local_addr().expect("bound address");
    (server, address)
}

fn pump(server: &mut Server, client: &mut Client, mut done: impl FnMut(&Server, &Client) -> bool) {
    for _ in 0..2000 {
        let _ = client.update();
        let _ = server.update();
        if done(server, client) {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!(
        "condition not reached: server {:?}, client {:?}",
        server.state(),
        client.state()
    );
}

fn connected_pair(server: &mut Server, address: &Address) -> (Client, SharedClient) {
    let mut client = Client::connect_to(address);
    pump(server, &mut client, |s, c| {
        c.state() == ClientState::Connected && !s.clients().is_empty()
    });
    let accepted = Rc::clone(&server.clients()[0]);
    (client, accepted)
}

fn read_exact_from(stream: &mut impl ByteStream, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..2000 {
        let mut buf = vec![0u8; len - out.len()];
        let n = stream.read(&mut buf).expect("read");
        out.extend_from_slice(&buf[..n]);
        if out.len() == len {
            return out;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("only {} of {len} bytes arrived", out.len());
}

// =========================================================================
// Connect and exchange
// =========================================================================

#[test]
fn test_connect_accept_and_exchange() {
    let (mut server, address) = listening_server(NewClientAction::Accept);
    assert_eq!(server.state(), ServerState::Listening);

    let (mut client, accepted) = connected_pair(&mut server, &address);

    assert_eq!(client.write(b"hello").unwrap(), 5);
    let got = read_exact_from(&mut *accepted.borrow_mut(), 5);
    assert_eq!(got, b"hello");

    accepted.borrow_mut().write(b"world").unwrap();
    let got = read_exact_from(&mut client, 5);
    assert_eq!(got, b"world");

    assert!(client.error().is_none());
    assert_eq!(accepted.borrow().state(), ServerClientState::Connected);
}

#[test]
fn test_client_notified_of_each_transition() {
    let (mut server, address) = listening_server(NewClientAction::Accept);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let mut client = Client::new();
    let log = Rc::clone(&seen);
    client.on_state_changed(move |_, state| log.borrow_mut().push(state));
    client.connect(&address).unwrap();
    pump(&mut server, &mut client, |_, c| c.is_connected());

    client.shutdown().unwrap();
    assert_eq!(
        *seen.borrow(),
        vec![
            ClientState::Connecting,
            ClientState::Connected,
            ClientState::Disconnecting,
            ClientState::Disconnected,
        ]
    );
}

#[test]
fn test_connect_while_active_is_busy() {
    let (mut server, address) = listening_server(NewClientAction::Accept);
    let (mut client, _accepted) = connected_pair(&mut server, &address);
    assert!(matches!(
        client.connect(&address),
        Err(tether_transport::SocketError::Busy)
    ));
}

#[test]
fn test_connect_refused_fails() {
    // Grab a free port, then stop listening on it.
    let address = {
        let (mut server, address) = listening_server(NewClientAction::Reject);
        server.close().unwrap();
        address
    };

    let mut client: Client = Client::connect_to(&address);
    for _ in 0..2000 {
        if client.update().is_err() || !client.is_active() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!client.is_connected());
    assert!(client.error().is_some());
}

// =========================================================================
// Close idempotence
// =========================================================================

#[test]
fn test_close_twice_notifies_once() {
    let (mut server, address) = listening_server(NewClientAction::Accept);
    let (mut client, _accepted) = connected_pair(&mut server, &address);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    client.on_state_changed(move |_, state| log.borrow_mut().push(state));

    client.close().unwrap();
    assert!(!client.is_open());
    client.close().unwrap();
    assert!(!client.is_open());

    assert_eq!(*seen.borrow(), vec![ClientState::Disconnected]);
}

#[test]
fn test_close_from_callback_does_not_recurse() {
    let (mut server, address) = listening_server(NewClientAction::Accept);
    let (mut client, _accepted) = connected_pair(&mut server, &address);

    let calls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&calls);
    client.on_state_changed(move |client, _| {
        *counter.borrow_mut() += 1;
        client.close().unwrap();
    });

    client.close().unwrap();
    assert_eq!(*calls.borrow(), 1);
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[test]
fn test_server_close_twice_notifies_once() {
    let (mut server, _) = listening_server(NewClientAction::Accept);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    server.on_state_changed(move |_, state| log.borrow_mut().push(state));

    server.close().unwrap();
    server.close().unwrap();
    assert!(!server.is_open());
    assert_eq!(*seen.borrow(), vec![ServerState::Closed]);
}

// =========================================================================
// Accept / reject policy
// =========================================================================

#[test]
fn test_reject_never_creates_client() {
    let (mut server, address) = listening_server(NewClientAction::Reject);
    let registered = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&registered);
    server.on_client_state_changed(move |_, _| *counter.borrow_mut() += 1);

    let mut client: Client = Client::connect_to(&address);
    pump(&mut server, &mut client, |_, c| {
        matches!(c.state(), ClientState::Disconnecting | ClientState::Failed)
    });

    assert!(server.clients().is_empty());
    assert_eq!(*registered.borrow(), 0);

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
}

#[test]
fn test_missing_policy_rejects() {
    let mut server = Server::listen_on(&Address::localhost(0), ServerConfig::default()).unwrap();
    let address = server.local_addr().unwrap();

    let mut client: Client = Client::connect_to(&address);
    pump(&mut server, &mut client, |_, c| !c.is_connected() && c.state() != ClientState::Connecting);
    assert!(server.clients().is_empty());
}

#[test]
fn test_none_leaves_connection_pending() {
    let (mut server, address) = listening_server(NewClientAction::None);
    let asked = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&asked);
    server.on_new_client(move |_| {
        *counter.borrow_mut() += 1;
        if *counter.borrow() < 3 {
            NewClientAction::None
        } else {
            NewClientAction::Accept
        }
    });

    let mut client: Client = Client::connect_to(&address);
    pump(&mut server, &mut client, |s, _| !s.clients().is_empty());
    assert!(*asked.borrow() >= 3);
}

// =========================================================================
// Hang-up handling
// =========================================================================

#[test]
fn test_server_shuts_down_client_after_peer_hangup() {
    let (mut server, address) = listening_server(NewClientAction::Accept);
    let reported = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&reported);
    server.on_client_state_changed(move |_, state| log.borrow_mut().push(state));

    let (mut client, accepted) = connected_pair(&mut server, &address);
    let own = Rc::new(RefCell::new(Vec::new()));
    let own_log = Rc::clone(&own);
    accepted
        .borrow_mut()
        .on_state_changed(move |_, state| own_log.borrow_mut().push(state));
    client.close().unwrap();

    for _ in 0..2000 {
        server.update().unwrap();
        if server.clients().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(server.clients().is_empty());
    assert!(!accepted.borrow().is_open());
    assert_eq!(accepted.borrow().state(), ServerClientState::Closed);
    // The server reports every transition the client made, even when
    // several happen within one update.
    assert_eq!(
        *own.borrow(),
        [ServerClientState::Closing, ServerClientState::Closed]
    );
    assert_eq!(
        *reported.borrow(),
        [
            ServerClientState::Connected,
            ServerClientState::Closing,
            ServerClientState::Closed,
        ]
    );
}

#[test]
fn test_client_sees_server_shutdown() {
    let (mut server, address) = listening_server(NewClientAction::Accept);
    let (mut client, accepted) = connected_pair(&mut server, &address);

    server.shutdown().unwrap();
    assert_eq!(server.state(), ServerState::Closed);
    assert!(server.clients().is_empty());
    assert_eq!(accepted.borrow().state(), ServerClientState::Closed);

    for _ in 0..2000 {
        let _ = client.update();
        if client.state() == ClientState::Disconnecting {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(client.state(), ClientState::Disconnecting);
    client.close().unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
}

// =========================================================================
// Unix domain sockets
// =========================================================================

#[cfg(unix)]
#[test]
fn test_unix_socket_exchange() {
    let path = std::env::temp_dir().join(format!("tether-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let address = Address::unix(&path);

    let mut server = Server::listen_on(&address, ServerConfig::default()).unwrap();
    server.on_new_client(|_| NewClientAction::Accept);

    let (mut client, accepted) = connected_pair(&mut server, &address);
    client.write(b"over-unix").unwrap();
    let got = read_exact_from(&mut *accepted.borrow_mut(), 9);
    assert_eq!(got, b"over-unix");

    server.close().unwrap();
    let _ = std::fs::remove_file(&path);
}
