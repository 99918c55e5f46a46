use crate::buffer::BufferPool;
use crate::channel::Channel;
use crate::config::SocketConfig;
use crate::connection::Connection;
use crate::errors::SocketError;
use crate::events::{guarded, SocketHandler};
use crate::identity::{IdentityError, PeerIdentity};
use crate::relay::{
    drain_status_queue, new_status_queue, queue_listener, ConnectOptions, RelayConnectionState,
    RelayMessage, RelaySockets, SendOutcome, StatusChange, StatusQueue, StatusSubscription,
    END_APP_GENERIC, END_APP_NO_CONNECTION, END_APP_SHUTDOWN, END_APP_TIMEOUT,
};
use log::*;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of the client's single outbound connection. `Disconnected` is
/// absorbing: every teardown path checks it first, so teardown and the
/// Disconnected event happen exactly once no matter which paths race.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    New,
    Connecting,
    Connected,
    Disconnected,
}

impl Display for ClientState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::New => f.write_str("New"),
            ClientState::Connecting => f.write_str("Connecting"),
            ClientState::Connected => f.write_str("Connected"),
            ClientState::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Drives one outbound connection to a host peer.
///
/// `connect` is fire-and-poll: it issues the relay dial and returns; progress
/// is observed through [`tick`](Client::tick), which the host must call once
/// per update cycle. Status notifications from the relay are queued by the
/// listener and only acted on inside `tick`, so events always fire on the
/// host's thread.
pub struct Client<R: RelaySockets> {
    relay: R,
    config: SocketConfig,
    state: ClientState,
    connection: Option<Arc<Connection>>,
    deadline: Option<Instant>,
    status_queue: StatusQueue,
    subscription: Option<StatusSubscription>,
    pool: BufferPool,
    scratch: Vec<RelayMessage>,
}

impl<R: RelaySockets> Client<R> {
    pub fn new(relay: R, config: SocketConfig) -> Self {
        let pool = BufferPool::new(
            config.effective_packet_size(),
            config.pool_prewarm,
            config.pool_max_retained,
        );
        Client {
            relay,
            config,
            state: ClientState::New,
            connection: None,
            deadline: None,
            status_queue: new_status_queue(),
            subscription: None,
            pool,
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The connection to the host, once `connect` has been called.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// Begin connecting to `peer`. Returns the connection entity immediately;
    /// the Connected (or Disconnected) event arrives through `tick`.
    ///
    /// Fails with `InvalidState` while a connection is already in flight or
    /// established, and after the terminal Disconnected state (a client is
    /// single-use; create a new one to reconnect).
    pub fn connect(&mut self, peer: PeerIdentity) -> Result<Arc<Connection>, SocketError> {
        match self.state {
            ClientState::Connecting => {
                return Err(SocketError::InvalidState("connect called while already connecting"))
            }
            ClientState::Connected => {
                return Err(SocketError::InvalidState("connect called while already connected"))
            }
            ClientState::Disconnected => {
                return Err(SocketError::InvalidState(
                    "connect called on a disconnected client; create a new socket",
                ))
            }
            ClientState::New => {}
        }
        if !peer.is_valid() {
            return Err(SocketError::InvalidPeer(IdentityError::Reserved));
        }

        if let Err(err) = self.relay.init_relay_network_access() {
            error!("Failed to start relay network access: {err}");
            return Err(err.into());
        }

        self.subscription =
            Some(self.relay.register_status_listener(queue_listener(&self.status_queue)));
        self.state = ClientState::Connecting;
        self.deadline = Some(Instant::now() + self.config.effective_timeout());

        match self.relay.connect_p2p(peer, &ConnectOptions::default()) {
            Ok(handle) => {
                let connection = Arc::new(Connection::new(handle, peer));
                info!("Connecting to {peer}");
                self.connection = Some(Arc::clone(&connection));
                Ok(connection)
            }
            Err(err) => {
                error!("Failed to start the relay dial to {peer}: {err}");
                // The entity still exists so the host observes exactly one
                // Disconnected on the next tick; Connecting never dangles.
                self.connection =
                    Some(Arc::new(Connection::new(crate::relay::ConnectionHandle::INVALID, peer)));
                self.internal_disconnect(END_APP_GENERIC, "relay dial failed");
                Err(err.into())
            }
        }
    }

    /// Close the connection, cancelling an in-flight dial if one is pending.
    /// A no-op in any other state.
    pub fn disconnect(&mut self, reason: Option<i32>, debug: Option<&str>) {
        match self.state {
            ClientState::Connected => {
                let debug = debug.unwrap_or("disconnect called");
                self.internal_disconnect(reason.unwrap_or(END_APP_GENERIC), debug);
            }
            ClientState::Connecting => {
                let debug = debug.unwrap_or("disconnect called while connecting");
                self.internal_disconnect(reason.unwrap_or(END_APP_GENERIC), debug);
            }
            state => debug!("Disconnect called but the client is {state}"),
        }
    }

    /// Send `payload` to the host on the given channel. Fail-soft after
    /// disconnect; a `NoConnection`/`InvalidParam` outcome from the relay is
    /// treated as an implicit disconnect rather than an error.
    pub fn send(&mut self, payload: &[u8], channel: Channel) -> Result<(), SocketError> {
        match self.state {
            ClientState::Disconnected => {
                warn!("Send called after the connection was disconnected");
                return Ok(());
            }
            ClientState::New => return Err(SocketError::InvalidState("send called before connect")),
            ClientState::Connecting | ClientState::Connected => {}
        }
        let max = self.config.effective_packet_size();
        if payload.len() > max {
            return Err(SocketError::PayloadTooLarge { size: payload.len(), max });
        }
        let connection = match self.connection.clone() {
            Some(connection) => connection,
            None => return Err(SocketError::InvalidState("send called before connect")),
        };
        let flags = channel.to_send_flags(self.config.no_nagle);
        match self.relay.send_message(connection.handle(), payload, flags) {
            SendOutcome::Ok => Ok(()),
            SendOutcome::NoConnection | SendOutcome::InvalidParam => {
                info!("Connection to {connection} was lost");
                self.internal_disconnect(END_APP_NO_CONNECTION, "no connection");
                Ok(())
            }
            outcome => {
                error!("Could not send: {outcome:?}");
                Ok(())
            }
        }
    }

    /// Uniform-surface variant of [`send`](Client::send). The client only has
    /// one connection, so a foreign entity is logged and the own connection
    /// to the host is used regardless.
    pub fn send_to(
        &mut self,
        connection: &Arc<Connection>,
        payload: &[u8],
        channel: Channel,
    ) -> Result<(), SocketError> {
        if let Some(own) = &self.connection {
            if !Arc::ptr_eq(own, connection) {
                warn!("Send called with a foreign connection entity; using the host connection");
            }
        }
        self.send(payload, channel)
    }

    /// Push buffered outbound messages onto the wire.
    pub fn flush(&mut self) {
        if let Some(connection) = &self.connection {
            if !connection.is_disconnected() {
                self.relay.flush_connection(connection.handle());
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.disconnect(Some(END_APP_SHUTDOWN), Some("socket shutdown"));
    }

    /// The single per-update entry point: drains queued status changes,
    /// checks the connect deadline, emits a pending Disconnected exactly
    /// once, and while connected drains inbound messages into Data events.
    pub fn tick<H: SocketHandler>(&mut self, handler: &mut H) {
        for change in drain_status_queue(&self.status_queue) {
            self.process_status_change(change, handler);
        }

        if self.state == ClientState::Connecting {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    error!("Connection attempt timed out");
                    self.internal_disconnect(END_APP_TIMEOUT, "connect attempt timed out");
                }
            }
        }

        if self.state == ClientState::Disconnected {
            self.emit_disconnected(handler);
        }

        // Not `else`: receiving may begin in the same tick that processed the
        // Connected notification.
        if self.state == ClientState::Connected {
            self.receive_messages(handler);
        }
    }

    fn process_status_change<H: SocketHandler>(&mut self, change: StatusChange, handler: &mut H) {
        match change.state {
            RelayConnectionState::Connected => {
                if self.state == ClientState::Connecting {
                    info!("Connection to {} established", change.peer);
                    self.state = ClientState::Connected;
                    self.deadline = None;
                    if let Some(connection) = self.connection.clone() {
                        guarded("connected", &connection, || handler.on_connected(&connection));
                    }
                } else {
                    warn!("Relay reported Connected but the client is {}", self.state);
                }
            }
            RelayConnectionState::ClosedByPeer | RelayConnectionState::ProblemDetectedLocally => {
                warn!(
                    "Connection was closed remotely. Reason: {}, Debug: {}",
                    change.end_reason, change.debug
                );
                self.internal_disconnect(
                    change.end_reason,
                    "connection closed by peer or problem detected",
                );
            }
            state => debug!("Connection state changed to {state}. Debug: {}", change.debug),
        }
    }

    fn emit_disconnected<H: SocketHandler>(&mut self, handler: &mut H) {
        if let Some(connection) = self.connection.clone() {
            if connection.mark_event_emitted() {
                guarded("disconnected", &connection, || handler.on_disconnected(&connection));
            }
        }
    }

    fn receive_messages<H: SocketHandler>(&mut self, handler: &mut H) {
        let connection = match self.connection.clone() {
            Some(connection) => connection,
            None => return,
        };
        let mut batch = std::mem::take(&mut self.scratch);
        self.relay.receive_on_connection(
            connection.handle(),
            self.config.max_messages_per_poll,
            &mut batch,
        );
        for message in batch.drain(..) {
            let buffer = self.pool.take_copy(&message.payload);
            self.relay.release_message(message);
            guarded("data", &connection, || handler.on_data(&connection, buffer.as_slice()));
            self.pool.release(buffer);
        }
        self.scratch = batch;
    }

    /// Idempotent teardown: releases the status subscription, closes the
    /// native connection and records the close reason. Never fails.
    fn internal_disconnect(&mut self, reason: i32, debug: &str) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.state = ClientState::Disconnected;
        self.deadline = None;
        if let Some(subscription) = self.subscription.take() {
            self.relay.release_subscription(subscription);
        }
        if let Some(connection) = &self.connection {
            connection.mark_disconnected();
            connection.set_close_info(reason, debug);
            if connection.handle().is_valid() {
                self.relay.close_connection(connection.handle(), reason, debug, false);
            }
            info!("{connection} disconnected with reason {reason}: {debug}");
        }
    }

    #[cfg(test)]
    fn expire_connect_deadline(&mut self) {
        let now = Instant::now();
        self.deadline = Some(now.checked_sub(std::time::Duration::from_millis(1)).unwrap_or(now));
    }
}

impl<R: RelaySockets> Drop for Client<R> {
    fn drop(&mut self) {
        self.internal_disconnect(END_APP_SHUTDOWN, "socket dropped");
    }
}

#[cfg(all(test, feature = "mock_relay"))]
mod test {
    use super::*;
    use crate::events::{RecordedEvent, RecordingHandler};
    use crate::relay::mock::{MemoryRelay, MemoryRelayNetwork};
    use crate::relay::{
        ConnectionHandle, ListenOptions, StatusListener, END_APP_REJECTED, END_APP_TIMEOUT,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const HOST: PeerIdentity = PeerIdentity::new(1001);
    const CLIENT: PeerIdentity = PeerIdentity::new(2002);

    /// A bare relay endpoint standing in for the host's server, driven by
    /// hand so the tests control exactly when statuses are delivered.
    struct RemoteHost {
        relay: MemoryRelay,
        inbox: Arc<Mutex<VecDeque<StatusChange>>>,
    }

    impl RemoteHost {
        fn listening(net: &MemoryRelayNetwork) -> Self {
            let relay = net.endpoint(HOST);
            let inbox: Arc<Mutex<VecDeque<StatusChange>>> = Arc::default();
            let sink = Arc::clone(&inbox);
            let listener: StatusListener = Arc::new(move |change| {
                sink.lock().unwrap().push_back(change);
            });
            relay.register_status_listener(listener);
            relay.create_listen_socket(&ListenOptions::default()).unwrap();
            RemoteHost { relay, inbox }
        }

        fn next_status(&self) -> StatusChange {
            self.inbox.lock().unwrap().pop_front().expect("no status change queued")
        }

        fn accept_next(&self) -> ConnectionHandle {
            let change = self.next_status();
            assert_eq!(change.state, RelayConnectionState::Connecting);
            self.relay.accept_connection(change.handle).unwrap();
            change.handle
        }
    }

    fn client(net: &MemoryRelayNetwork) -> Client<MemoryRelay> {
        Client::new(net.endpoint(CLIENT), SocketConfig::default())
    }

    #[test]
    fn connect_is_rejected_in_wrong_states() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let _host = RemoteHost::listening(&net);
        let mut client = client(&net);

        assert!(matches!(client.connect(PeerIdentity::INVALID), Err(SocketError::InvalidPeer(_))));
        client.connect(HOST).unwrap();
        assert_eq!(client.state(), ClientState::Connecting);
        assert!(matches!(client.connect(HOST), Err(SocketError::InvalidState(_))));
    }

    #[test]
    fn full_lifecycle_fires_connected_then_data_then_disconnected() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let host = RemoteHost::listening(&net);
        let mut client = client(&net);
        let mut handler = RecordingHandler::new();

        client.connect(HOST).unwrap();
        let host_handle = host.accept_next();
        client.tick(&mut handler);
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(handler.events, vec![RecordedEvent::Connected(HOST)]);

        host.relay.send_message(host_handle, b"welcome", Channel::Reliable.to_send_flags(true));
        client.tick(&mut handler);
        assert_eq!(handler.payloads(), vec![b"welcome".as_slice()]);

        // Peer closes; the client sees exactly one Disconnected.
        host.relay.close_connection(host_handle, END_APP_GENERIC, "bye", false);
        client.tick(&mut handler);
        client.tick(&mut handler);
        assert_eq!(handler.disconnected_count(), 1);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.connection().unwrap().close_info().unwrap().reason, END_APP_GENERIC);
    }

    #[test]
    fn timeout_disconnects_without_a_connected_event() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let _host = RemoteHost::listening(&net);
        let mut client = client(&net);
        let mut handler = RecordingHandler::new();

        client.connect(HOST).unwrap();
        client.expire_connect_deadline();
        client.tick(&mut handler);

        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(handler.connected_count(), 0);
        assert_eq!(handler.disconnected_count(), 1);
        assert_eq!(client.connection().unwrap().close_info().unwrap().reason, END_APP_TIMEOUT);
    }

    #[test]
    fn cancelling_suppresses_a_stale_connected_notification() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let host = RemoteHost::listening(&net);
        let mut client = client(&net);
        let mut handler = RecordingHandler::new();

        client.connect(HOST).unwrap();
        // The host accepts, so a Connected notification is queued for the
        // client, but the client cancels before its next tick.
        host.accept_next();
        client.disconnect(None, None);
        assert_eq!(client.state(), ClientState::Disconnected);

        client.tick(&mut handler);
        client.tick(&mut handler);
        assert_eq!(handler.connected_count(), 0);
        assert_eq!(handler.disconnected_count(), 1);
    }

    #[test]
    fn remote_rejection_surfaces_the_rejected_reason() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let host = RemoteHost::listening(&net);
        let mut client = client(&net);
        let mut handler = RecordingHandler::new();

        client.connect(HOST).unwrap();
        let change = host.next_status();
        host.relay.close_connection(change.handle, END_APP_REJECTED, "rejected by application", false);
        client.tick(&mut handler);

        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(handler.connected_count(), 0);
        assert_eq!(handler.disconnected_count(), 1);
        assert_eq!(client.connection().unwrap().close_info().unwrap().reason, END_APP_REJECTED);
    }

    #[test]
    fn send_failure_disconnects_exactly_once_despite_racing_paths() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let host = RemoteHost::listening(&net);
        let mut client = client(&net);
        let mut handler = RecordingHandler::new();

        client.connect(HOST).unwrap();
        let host_handle = host.accept_next();
        client.tick(&mut handler);
        assert_eq!(client.state(), ClientState::Connected);

        // The host closes; a ClosedByPeer notification is queued. Before the
        // client ticks, it also hits the dead connection with a send.
        host.relay.close_connection(host_handle, END_APP_GENERIC, "gone", false);
        client.send(b"into the void", Channel::Unreliable).unwrap();
        assert_eq!(client.state(), ClientState::Disconnected);

        client.tick(&mut handler);
        client.tick(&mut handler);
        assert_eq!(handler.disconnected_count(), 1);
        assert_eq!(
            client.connection().unwrap().close_info().unwrap().reason,
            END_APP_NO_CONNECTION
        );
    }

    #[test]
    fn operations_after_disconnect_are_fail_soft() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let host = RemoteHost::listening(&net);
        let mut client = client(&net);
        let mut handler = RecordingHandler::new();

        client.connect(HOST).unwrap();
        host.accept_next();
        client.tick(&mut handler);
        client.disconnect(None, None);

        client.send(b"late", Channel::Reliable).unwrap();
        client.disconnect(None, None);
        client.flush();
        client.tick(&mut handler);
        assert_eq!(handler.disconnected_count(), 1);
    }

    #[test]
    fn oversized_sends_are_rejected_before_the_relay() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let host = RemoteHost::listening(&net);
        let mut client = client(&net);
        let mut handler = RecordingHandler::new();

        client.connect(HOST).unwrap();
        host.accept_next();
        client.tick(&mut handler);

        let huge = vec![0u8; SocketConfig::default().effective_packet_size() + 1];
        assert!(matches!(
            client.send(&huge, Channel::Reliable),
            Err(SocketError::PayloadTooLarge { .. })
        ));
        // Still connected: an oversized payload is host misuse, not a link
        // failure.
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn denied_relay_access_fails_the_connect_cleanly() {
        env_logger::try_init().ok();
        let net = MemoryRelayNetwork::new();
        let _host = RemoteHost::listening(&net);
        net.deny_relay_access(CLIENT);
        let mut client = client(&net);

        assert!(matches!(client.connect(HOST), Err(SocketError::Relay(_))));
        assert_eq!(client.state(), ClientState::New);
    }
}
