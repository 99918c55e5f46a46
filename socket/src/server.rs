use crate::buffer::BufferPool;
use crate::channel::Channel;
use crate::config::SocketConfig;
use crate::connection::Connection;
use crate::errors::SocketError;
use crate::events::{guarded, AcceptPolicy, ConnectionAttempt, SocketHandler};
use crate::identity::PeerIdentity;
use crate::relay::{
    drain_status_queue, new_status_queue, queue_listener, ConnectionHandle, ListenOptions,
    ListenSocket, PollGroup, RelayConnectionState, RelayMessage, RelaySockets, SendOutcome,
    StatusChange, StatusQueue, StatusSubscription, END_APP_GENERIC, END_APP_NO_CONNECTION,
    END_APP_REJECTED, END_APP_SHUTDOWN,
};
use log::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// The server's view of its live peers: a bidirectional handle ↔ peer map.
/// Both directions are kept in sync behind this one interface so lookups are
/// O(1) either way and the two maps can never drift apart.
#[derive(Default)]
struct ConnectionTable {
    by_handle: HashMap<ConnectionHandle, Arc<Connection>>,
    by_peer: HashMap<PeerIdentity, ConnectionHandle>,
}

impl ConnectionTable {
    fn insert(&mut self, connection: Arc<Connection>) {
        let handle = connection.handle();
        let peer = connection.peer();
        if self.by_handle.insert(handle, connection).is_some() {
            warn!("Connection table already had an entry for {handle}; replacing it");
        }
        self.by_peer.insert(peer, handle);
    }

    fn remove(&mut self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        let connection = self.by_handle.remove(&handle)?;
        // Only drop the reverse mapping if it still points at this handle; a
        // newer connection from the same peer may have taken it over.
        if self.by_peer.get(&connection.peer()) == Some(&handle) {
            self.by_peer.remove(&connection.peer());
        }
        Some(connection)
    }

    fn by_handle(&self, handle: ConnectionHandle) -> Option<&Arc<Connection>> {
        self.by_handle.get(&handle)
    }

    fn by_peer(&self, peer: PeerIdentity) -> Option<&Arc<Connection>> {
        self.by_peer.get(&peer).and_then(|handle| self.by_handle.get(handle))
    }

    fn len(&self) -> usize {
        self.by_handle.len()
    }

    fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.by_handle.values().cloned().collect()
    }
}

/// Owns a listen endpoint and the table of accepted connections, multiplexing
/// receive across all of them through one poll group.
///
/// Inbound attempts are screened by the optional [`AcceptPolicy`]; a
/// connection entity only exists once the relay reports the peer fully
/// established. As on the client, all events fire from inside
/// [`tick`](Server::tick) on the host's thread.
pub struct Server<R: RelaySockets> {
    relay: R,
    config: SocketConfig,
    policy: Option<Box<dyn AcceptPolicy>>,
    listen_socket: Option<ListenSocket>,
    poll_group: Option<PollGroup>,
    table: ConnectionTable,
    status_queue: StatusQueue,
    subscription: Option<StatusSubscription>,
    pending_disconnects: VecDeque<Arc<Connection>>,
    pool: BufferPool,
    scratch: Vec<RelayMessage>,
}

impl<R: RelaySockets> Server<R> {
    pub fn new(relay: R, config: SocketConfig, policy: Option<Box<dyn AcceptPolicy>>) -> Self {
        let pool = BufferPool::new(
            config.effective_packet_size(),
            config.pool_prewarm,
            config.pool_max_retained,
        );
        Server {
            relay,
            config,
            policy,
            listen_socket: None,
            poll_group: None,
            table: ConnectionTable::default(),
            status_queue: new_status_queue(),
            subscription: None,
            pending_disconnects: VecDeque::new(),
            pool,
            scratch: Vec::new(),
        }
    }

    /// Open the listen endpoint and the shared poll group. Fatal if relay
    /// network access cannot be negotiated.
    pub fn listen(&mut self) -> Result<(), SocketError> {
        if self.listen_socket.is_some() {
            return Err(SocketError::InvalidState("server is already listening"));
        }
        if let Err(err) = self.relay.init_relay_network_access() {
            error!("Failed to start relay network access: {err}");
            return Err(err.into());
        }
        self.subscription =
            Some(self.relay.register_status_listener(queue_listener(&self.status_queue)));
        let socket = self.relay.create_listen_socket(&ListenOptions::default())?;
        self.listen_socket = Some(socket);
        self.poll_group = Some(self.relay.create_poll_group());
        info!("Server listening for relay connections");
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listen_socket.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.table.connections()
    }

    pub fn find_connection(&self, peer: PeerIdentity) -> Option<Arc<Connection>> {
        self.table.by_peer(peer).cloned()
    }

    /// Explicit server-initiated close. Fail-soft if the connection is
    /// already down.
    pub fn disconnect(
        &mut self,
        connection: &Arc<Connection>,
        reason: Option<i32>,
        debug: Option<&str>,
    ) {
        if connection.is_disconnected() {
            warn!("Trying to disconnect {connection} but it is already disconnected");
            return;
        }
        self.internal_disconnect(
            connection,
            reason.unwrap_or(END_APP_GENERIC),
            debug.unwrap_or("disconnected by server"),
        );
    }

    /// Send `payload` to one peer. Same taxonomy as the client: fail-soft
    /// after disconnect, implicit disconnect on `NoConnection`/`InvalidParam`.
    pub fn send(
        &mut self,
        connection: &Arc<Connection>,
        payload: &[u8],
        channel: Channel,
    ) -> Result<(), SocketError> {
        if connection.is_disconnected() {
            warn!("Send called for {connection} after it was disconnected");
            return Ok(());
        }
        let max = self.config.effective_packet_size();
        if payload.len() > max {
            return Err(SocketError::PayloadTooLarge { size: payload.len(), max });
        }
        let flags = channel.to_send_flags(self.config.no_nagle);
        match self.relay.send_message(connection.handle(), payload, flags) {
            SendOutcome::Ok => Ok(()),
            SendOutcome::NoConnection | SendOutcome::InvalidParam => {
                info!("Connection to {connection} was lost");
                self.internal_disconnect(connection, END_APP_NO_CONNECTION, "no connection");
                Ok(())
            }
            outcome => {
                error!("Could not send to {connection}: {outcome:?}");
                Ok(())
            }
        }
    }

    pub fn flush(&mut self) {
        for connection in self.table.by_handle.values() {
            self.relay.flush_connection(connection.handle());
        }
    }

    /// Tear the whole endpoint down: every connection is closed (their
    /// Disconnected events fire on the next tick, if the host keeps ticking),
    /// then the poll group, listen socket and status subscription are
    /// released. Idempotent.
    pub fn shutdown(&mut self) {
        for connection in self.table.connections() {
            self.internal_disconnect(&connection, END_APP_SHUTDOWN, "server shutting down");
        }
        if let Some(group) = self.poll_group.take() {
            self.relay.destroy_poll_group(group);
        }
        if let Some(socket) = self.listen_socket.take() {
            self.relay.close_listen_socket(socket);
            info!("Server listen socket closed");
        }
        if let Some(subscription) = self.subscription.take() {
            self.relay.release_subscription(subscription);
        }
    }

    /// The single per-update entry point: drains queued status changes, then
    /// fires pending Disconnected events exactly once each, then multiplexes
    /// receive across the poll group. The ordering means a peer's final data
    /// is never delivered after its Disconnected event, and a connect/close
    /// in one batch still yields a Connected-then-Disconnected pair.
    pub fn tick<H: SocketHandler>(&mut self, handler: &mut H) {
        for change in drain_status_queue(&self.status_queue) {
            self.process_status_change(change, handler);
        }

        while let Some(connection) = self.pending_disconnects.pop_front() {
            if connection.mark_event_emitted() {
                guarded("disconnected", &connection, || handler.on_disconnected(&connection));
            }
        }

        if !self.table.is_empty() {
            self.receive_messages(handler);
        }
    }

    fn process_status_change<H: SocketHandler>(&mut self, change: StatusChange, handler: &mut H) {
        match change.state {
            RelayConnectionState::Connecting => self.review_attempt(change),
            RelayConnectionState::Connected => self.admit_connection(change, handler),
            RelayConnectionState::ClosedByPeer | RelayConnectionState::ProblemDetectedLocally => {
                match self.table.by_handle(change.handle).cloned() {
                    Some(connection) => {
                        self.internal_disconnect(
                            &connection,
                            change.end_reason,
                            "connection closed by peer or problem detected",
                        );
                    }
                    None => debug!(
                        "Close notification for unknown connection {}; already gone",
                        change.handle
                    ),
                }
            }
            state => {
                debug!("Connection {} state changed to {state}. Debug: {}", change.peer, change.debug)
            }
        }
    }

    fn review_attempt(&mut self, change: StatusChange) {
        let attempt = ConnectionAttempt::new(change.handle, change.peer);
        let accepted = match self.policy.as_mut() {
            Some(policy) => policy.review(&attempt),
            None => true,
        };
        if !accepted {
            info!("Rejecting connection attempt from {}", change.peer);
            self.relay.close_connection(
                change.handle,
                END_APP_REJECTED,
                "rejected by application",
                false,
            );
            return;
        }
        match self.relay.accept_connection(change.handle) {
            Ok(()) => debug!("Accepting connection attempt from {}", change.peer),
            Err(err) => warn!("Connection from {} could not be accepted: {err}", change.peer),
        }
    }

    fn admit_connection<H: SocketHandler>(&mut self, change: StatusChange, handler: &mut H) {
        if self.table.by_handle(change.handle).is_some() {
            warn!("Relay reported Connected twice for {}", change.handle);
            return;
        }
        let connection = Arc::new(Connection::new(change.handle, change.peer));
        self.table.insert(Arc::clone(&connection));
        if let Some(group) = self.poll_group {
            self.relay.set_connection_poll_group(change.handle, Some(group));
        }
        info!("Peer {} connected as {connection}", change.peer);
        guarded("connected", &connection, || handler.on_connected(&connection));
    }

    fn receive_messages<H: SocketHandler>(&mut self, handler: &mut H) {
        let group = match self.poll_group {
            Some(group) => group,
            None => return,
        };
        let mut batch = std::mem::take(&mut self.scratch);
        self.relay.receive_on_poll_group(group, self.config.max_messages_per_poll, &mut batch);
        for message in batch.drain(..) {
            match self.table.by_handle(message.connection).cloned() {
                Some(connection) => {
                    let buffer = self.pool.take_copy(&message.payload);
                    self.relay.release_message(message);
                    guarded("data", &connection, || handler.on_data(&connection, buffer.as_slice()));
                    self.pool.release(buffer);
                }
                None => {
                    warn!("Failed to find a connection for {}", message.connection);
                    self.relay.release_message(message);
                }
            }
        }
        self.scratch = batch;
    }

    /// Idempotent teardown for one connection. The Disconnected event is
    /// queued for the tick drain rather than fired here, because this can run
    /// while the same status batch still references the table.
    fn internal_disconnect(&mut self, connection: &Arc<Connection>, reason: i32, debug: &str) {
        if !connection.mark_disconnected() {
            debug!("{connection} is already disconnected");
            return;
        }
        connection.set_close_info(reason, debug);
        self.relay.set_connection_poll_group(connection.handle(), None);
        self.relay.close_connection(connection.handle(), reason, debug, false);
        self.table.remove(connection.handle());
        self.pending_disconnects.push_back(Arc::clone(connection));
        info!("{connection} disconnected with reason {reason}: {debug}");
    }
}

impl<R: RelaySockets> Drop for Server<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
