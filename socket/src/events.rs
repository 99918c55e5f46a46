use crate::connection::Connection;
use crate::identity::PeerIdentity;
use crate::relay::ConnectionHandle;
use log::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Receives the lifecycle and data events of a socket.
///
/// All three callbacks are invoked synchronously from inside `tick`, on the
/// host's own thread, never from the relay's callback dispatch. The `payload`
/// slice handed to `on_data` is only valid for the duration of the call; copy
/// it if it must outlive the callback.
pub trait SocketHandler {
    fn on_connected(&mut self, connection: &Arc<Connection>);
    fn on_data(&mut self, connection: &Arc<Connection>, payload: &[u8]);
    fn on_disconnected(&mut self, connection: &Arc<Connection>);
}

/// Invoke one handler callback, containing any panic so a misbehaving
/// subscriber cannot corrupt the pump's draining loop.
pub(crate) fn guarded<F: FnOnce()>(event: &str, connection: &Connection, callback: F) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("The {event} handler panicked while handling {connection}; continuing the drain");
    }
}

/// Opaque view of an inbound connection attempt, handed to the accept policy
/// before any connection entity exists.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionAttempt {
    handle: ConnectionHandle,
    peer: PeerIdentity,
}

impl ConnectionAttempt {
    pub(crate) fn new(handle: ConnectionHandle, peer: PeerIdentity) -> Self {
        ConnectionAttempt { handle, peer }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }
}

/// Server-side hook deciding whether an inbound attempt may proceed. Invoked
/// synchronously during the status-change drain; servers without a policy
/// accept everything.
pub trait AcceptPolicy: Send {
    fn review(&mut self, attempt: &ConnectionAttempt) -> bool;
}

impl<F> AcceptPolicy for F
where
    F: FnMut(&ConnectionAttempt) -> bool + Send,
{
    fn review(&mut self, attempt: &ConnectionAttempt) -> bool {
        self(attempt)
    }
}

/// What a [`RecordingHandler`] saw, in delivery order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedEvent {
    Connected(PeerIdentity),
    Data(PeerIdentity, Vec<u8>),
    Disconnected(PeerIdentity),
}

/// A handler that records every event it receives. Used by the test suites;
/// also handy as a starting point for host integrations.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub events: Vec<RecordedEvent>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        RecordingHandler::default()
    }

    pub fn connected_count(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, RecordedEvent::Connected(_))).count()
    }

    pub fn disconnected_count(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, RecordedEvent::Disconnected(_))).count()
    }

    pub fn payloads(&self) -> Vec<&[u8]> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Data(_, payload) => Some(payload.as_slice()),
                _ => None,
            })
            .collect()
    }
}

impl SocketHandler for RecordingHandler {
    fn on_connected(&mut self, connection: &Arc<Connection>) {
        self.events.push(RecordedEvent::Connected(connection.peer()));
    }

    fn on_data(&mut self, connection: &Arc<Connection>, payload: &[u8]) {
        self.events.push(RecordedEvent::Data(connection.peer(), payload.to_vec()));
    }

    fn on_disconnected(&mut self, connection: &Arc<Connection>) {
        self.events.push(RecordedEvent::Disconnected(connection.peer()));
    }
}
