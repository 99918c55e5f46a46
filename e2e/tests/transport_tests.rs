use anyhow::{ensure, Result};
use e2e::{pump, TestNet};
use rand::Rng;
use tether_socket::relay::{END_APP_GENERIC, END_APP_REJECTED, END_APP_SHUTDOWN};
use tether_socket::{Channel, ClientState, ConnectionAttempt, RecordedEvent};

const SERVER_ID: u64 = 9000;

#[test]
fn full_lifecycle_over_the_fabric() -> Result<()> {
    let net = TestNet::new();
    let mut server = net.server(SERVER_ID, None);
    let mut client = net.client(7001);

    let connection = client.client.connect(server.peer)?;
    pump(&mut server, &mut [&mut client], 3);
    ensure!(client.is_connected(), "client should be connected after pumping");
    ensure!(server.server.connection_count() == 1);
    assert_eq!(client.events.events, vec![RecordedEvent::Connected(server.peer)]);
    assert_eq!(server.events.events, vec![RecordedEvent::Connected(client.peer)]);

    // Payloads flow both ways on both channels.
    client.client.send(b"hello reliable", Channel::Reliable)?;
    client.client.send(b"hello unreliable", Channel::Unreliable)?;
    client.client.flush();
    pump(&mut server, &mut [&mut client], 1);
    assert_eq!(
        server.events.payloads(),
        vec![b"hello reliable".as_slice(), b"hello unreliable".as_slice()]
    );

    let server_conn = server.server.find_connection(client.peer).unwrap();
    server.server.send(&server_conn, b"welcome", Channel::Reliable)?;
    pump(&mut server, &mut [&mut client], 1);
    assert_eq!(client.events.payloads(), vec![b"welcome".as_slice()]);

    // Client leaves; both sides observe exactly one Disconnected.
    client.client.disconnect(Some(END_APP_GENERIC), Some("going home"));
    pump(&mut server, &mut [&mut client], 3);
    ensure!(client.events.disconnected_count() == 1);
    ensure!(server.events.disconnected_count() == 1);
    ensure!(server.server.connection_count() == 0);
    ensure!(connection.is_disconnected());

    // No relay-owned message memory may be left unreleased.
    ensure!(net.fabric().outstanding_messages() == 0);
    Ok(())
}

#[test]
fn reject_all_policy_turns_clients_away() -> Result<()> {
    let net = TestNet::new();
    let reject_all = |_: &ConnectionAttempt| false;
    let mut server = net.server(SERVER_ID, Some(Box::new(reject_all)));
    let mut client = net.client(7002);

    client.client.connect(server.peer)?;
    pump(&mut server, &mut [&mut client], 3);

    ensure!(client.client.state() == ClientState::Disconnected);
    ensure!(client.events.connected_count() == 0);
    ensure!(client.events.disconnected_count() == 1);
    let info = client.client.connection().unwrap().close_info().unwrap();
    ensure!(info.reason == END_APP_REJECTED, "reason was {}", info.reason);
    ensure!(server.server.connection_count() == 0);
    ensure!(server.events.events.is_empty());
    Ok(())
}

#[test]
fn several_clients_multiplex_over_one_poll_group() -> Result<()> {
    let net = TestNet::new();
    let mut server = net.server(SERVER_ID, None);
    let mut alice = net.client(7101);
    let mut bob = net.client(7102);
    let mut carol = net.client(7103);

    alice.client.connect(server.peer)?;
    bob.client.connect(server.peer)?;
    carol.client.connect(server.peer)?;
    pump(&mut server, &mut [&mut alice, &mut bob, &mut carol], 3);
    ensure!(server.server.connection_count() == 3);

    let mut rng = rand::rng();
    for client in [&mut alice, &mut bob, &mut carol] {
        let payload: Vec<u8> = (0..64).map(|_| rng.random::<u8>()).collect();
        client.client.send(&payload, Channel::Unreliable)?;
        pump(&mut server, &mut [&mut *client], 1);
        // Echo each payload back to its sender only.
        let conn = server.server.find_connection(client.peer).unwrap();
        server.server.send(&conn, &payload, Channel::Unreliable)?;
        pump(&mut server, &mut [&mut *client], 1);
        assert_eq!(client.events.payloads(), vec![payload.as_slice()]);
    }

    // Every inbound message reached the server attributed to the right peer.
    for client in [&alice, &bob, &carol] {
        let count = server
            .events
            .events
            .iter()
            .filter(|e| matches!(e, RecordedEvent::Data(peer, _) if *peer == client.peer))
            .count();
        ensure!(count == 1, "{} messages attributed to {}", count, client.peer);
    }
    ensure!(net.fabric().outstanding_messages() == 0);
    Ok(())
}

#[test]
fn server_shutdown_disconnects_every_client() -> Result<()> {
    let net = TestNet::new();
    let mut server = net.server(SERVER_ID, None);
    let mut alice = net.client(7201);
    let mut bob = net.client(7202);

    alice.client.connect(server.peer)?;
    bob.client.connect(server.peer)?;
    pump(&mut server, &mut [&mut alice, &mut bob], 3);
    ensure!(server.server.connection_count() == 2);

    server.server.shutdown();
    pump(&mut server, &mut [&mut alice, &mut bob], 3);

    for client in [&alice, &bob] {
        ensure!(client.client.state() == ClientState::Disconnected);
        ensure!(client.events.disconnected_count() == 1);
        let info = client.client.connection().unwrap().close_info().unwrap();
        ensure!(info.reason == END_APP_SHUTDOWN);
    }
    ensure!(server.events.disconnected_count() == 2);
    Ok(())
}

#[test]
fn callbacks_from_a_foreign_thread_are_deferred_to_tick() -> Result<()> {
    use std::thread;
    use std::time::Duration;

    let net = TestNet::new();
    let mut server = net.server(SERVER_ID, None);

    // The whole client lives on another thread, so every status callback the
    // server receives is raised from a foreign thread, and vice versa.
    let mut client = net.client(7301);
    let worker = thread::spawn(move || {
        client.client.connect(tether_socket::PeerIdentity::new(SERVER_ID)).unwrap();
        for _ in 0..200 {
            client.tick();
            if client.is_connected() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(client.is_connected(), "client never connected");
        client.client.send(b"from afar", Channel::Reliable).unwrap();
        // Keep ticking until the server's goodbye arrives.
        for _ in 0..200 {
            client.tick();
            if client.events.disconnected_count() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        client
    });

    let mut seen_payload = false;
    for _ in 0..500 {
        server.tick();
        if !seen_payload && !server.events.payloads().is_empty() {
            seen_payload = true;
            let conn = server.server.find_connection(tether_socket::PeerIdentity::new(7301)).unwrap();
            server.server.disconnect(&conn, None, Some("that is enough"));
        }
        if server.events.disconnected_count() > 0 && seen_payload {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    let client = worker.join().expect("client thread panicked");
    ensure!(seen_payload, "server never received the client payload");
    ensure!(client.events.connected_count() == 1);
    ensure!(client.events.disconnected_count() == 1);
    ensure!(server.events.disconnected_count() == 1);
    Ok(())
}
