//! The external relay service contract.
//!
//! Everything the adapters know about the underlying peer-to-peer relay is
//! captured by the [`RelaySockets`] trait: an opaque capability set addressed
//! by native handles. Production backends wrap a real relay SDK; tests use the
//! in-memory [`mock::MemoryRelayNetwork`] fabric.
//!
//! Two conventions matter to callers:
//!
//! - Status-change notifications arrive on a thread the *service* controls.
//!   Registered listeners must therefore do nothing but append an immutable
//!   [`StatusChange`] snapshot to a queue; all real work happens later, on the
//!   tick thread.
//! - Received [`RelayMessage`]s hold payload memory owned by the service and
//!   must be handed back with [`RelaySockets::release_message`] once the
//!   payload has been copied out.

use crate::identity::PeerIdentity;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[cfg(feature = "mock_relay")]
pub mod mock;

/// Largest payload the relay service will carry in a single message.
pub const RELAY_MAX_MESSAGE_SIZE: usize = 512 * 1024;

// Send-flag bitmask. The reliable bit is the only one with routing meaning;
// the nagle/delay bits are scheduling hints.
pub const SEND_UNRELIABLE: i32 = 0;
pub const SEND_NO_NAGLE: i32 = 1;
pub const SEND_NO_DELAY: i32 = 4;
pub const SEND_RELIABLE: i32 = 8;
pub const SEND_UNRELIABLE_NO_NAGLE: i32 = SEND_UNRELIABLE | SEND_NO_NAGLE;
pub const SEND_UNRELIABLE_NO_DELAY: i32 = SEND_UNRELIABLE | SEND_NO_DELAY;
pub const SEND_RELIABLE_NO_NAGLE: i32 = SEND_RELIABLE | SEND_NO_NAGLE;

// End-reason codes in the application band of the relay's reason space.
pub const END_APP_GENERIC: i32 = 1000;
pub const END_APP_TIMEOUT: i32 = 1001;
pub const END_APP_REJECTED: i32 = 1002;
pub const END_APP_NO_CONNECTION: i32 = 1003;
pub const END_APP_SHUTDOWN: i32 = 1004;

/// Native handle for one end of a relay connection. Zero is never a live
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u32);

impl ConnectionHandle {
    pub const INVALID: ConnectionHandle = ConnectionHandle(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Native handle for a listen endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenSocket(pub u32);

/// Native handle for a receive multiplex group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PollGroup(pub u32);

/// Connection state as reported by the relay service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayConnectionState {
    /// An inbound attempt (server side) or an in-flight dial (client side).
    Connecting,
    /// The relay is still picking a route; treated as informational.
    FindingRoute,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

impl Display for RelayConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelayConnectionState::Connecting => "Connecting",
            RelayConnectionState::FindingRoute => "FindingRoute",
            RelayConnectionState::Connected => "Connected",
            RelayConnectionState::ClosedByPeer => "ClosedByPeer",
            RelayConnectionState::ProblemDetectedLocally => "ProblemDetectedLocally",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of one status-change notification, captured the instant
/// the service calls back and queued verbatim.
#[derive(Clone, Debug)]
pub struct StatusChange {
    pub handle: ConnectionHandle,
    pub peer: PeerIdentity,
    pub state: RelayConnectionState,
    pub end_reason: i32,
    pub debug: String,
}

/// One received message. `payload` is service-owned memory; copy it out and
/// return the message with [`RelaySockets::release_message`].
#[derive(Debug)]
pub struct RelayMessage {
    pub connection: ConnectionHandle,
    pub payload: Vec<u8>,
}

/// Result of a send attempt, mirroring the relay's result codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    /// The service accepted the call but did nothing with it.
    Ignored,
    NoConnection,
    InvalidParam,
    Other(i32),
}

/// Options for an outbound dial. `virtual_port` distinguishes multiple
/// services behind one peer identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOptions {
    pub virtual_port: u32,
}

/// Options for a listen endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListenOptions {
    pub virtual_port: u32,
}

#[derive(Clone, Debug, Error)]
pub enum RelayError {
    #[error("Relay network access was denied")]
    AccessDenied,
    #[error("Handle does not name a live relay object")]
    InvalidHandle,
    #[error("Relay service error: {0}")]
    Internal(String),
}

/// Callback registered for status-change notifications. Invoked by the
/// service from its own thread; must only capture-and-queue.
pub type StatusListener = Arc<dyn Fn(StatusChange) + Send + Sync>;

/// Token for a registered status listener; released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct StatusSubscription(pub u64);

/// The capability set the adapters consume from the relay service.
///
/// All methods are called from the tick thread. Implementations may invoke
/// registered status listeners from any thread, but never re-entrantly from
/// within one of these calls' listener dispatch.
pub trait RelaySockets {
    /// One-time capability negotiation with the relay network. Idempotent;
    /// failure makes every other operation of the owning adapter fail.
    fn init_relay_network_access(&self) -> Result<(), RelayError>;

    fn register_status_listener(&self, listener: StatusListener) -> StatusSubscription;
    fn release_subscription(&self, subscription: StatusSubscription);

    fn connect_p2p(
        &self,
        peer: PeerIdentity,
        options: &ConnectOptions,
    ) -> Result<ConnectionHandle, RelayError>;

    fn create_listen_socket(&self, options: &ListenOptions) -> Result<ListenSocket, RelayError>;
    fn close_listen_socket(&self, socket: ListenSocket);

    fn create_poll_group(&self) -> PollGroup;
    fn destroy_poll_group(&self, group: PollGroup);
    /// Assign or clear (`None`) the poll group of a connection. Returns false
    /// if the handle is unknown.
    fn set_connection_poll_group(&self, handle: ConnectionHandle, group: Option<PollGroup>)
        -> bool;

    /// Accept an inbound attempt previously reported as `Connecting`.
    fn accept_connection(&self, handle: ConnectionHandle) -> Result<(), RelayError>;

    /// Close a connection, sending `reason` and `debug` to the peer. Returns
    /// false if the handle was not live.
    fn close_connection(&self, handle: ConnectionHandle, reason: i32, debug: &str, linger: bool)
        -> bool;

    fn send_message(&self, handle: ConnectionHandle, payload: &[u8], flags: i32) -> SendOutcome;

    /// Drain up to `max` pending messages for a single connection into `out`.
    /// Returns the number appended.
    fn receive_on_connection(
        &self,
        handle: ConnectionHandle,
        max: usize,
        out: &mut Vec<RelayMessage>,
    ) -> usize;

    /// Drain up to `max` pending messages across every connection assigned to
    /// `group` into `out`. Returns the number appended.
    fn receive_on_poll_group(
        &self,
        group: PollGroup,
        max: usize,
        out: &mut Vec<RelayMessage>,
    ) -> usize;

    /// Hand a received message's payload memory back to the service.
    fn release_message(&self, message: RelayMessage);

    /// Push any buffered outbound messages for the connection onto the wire.
    fn flush_connection(&self, handle: ConnectionHandle);
}

/// The append-only queue that carries status changes from the service thread
/// to the tick thread. The listener side only pushes; the tick side swaps the
/// whole queue out and drains it FIFO.
pub(crate) type StatusQueue = Arc<Mutex<VecDeque<StatusChange>>>;

pub(crate) fn new_status_queue() -> StatusQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Build the listener that captures notifications into `queue`. Appending
/// must never fail, so a poisoned lock is recovered rather than propagated.
pub(crate) fn queue_listener(queue: &StatusQueue) -> StatusListener {
    let queue = Arc::clone(queue);
    Arc::new(move |change: StatusChange| {
        let mut guard = match queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push_back(change);
    })
}

/// Take everything queued so far. Notifications that arrive while the drain
/// is being processed wait for the next tick.
pub(crate) fn drain_status_queue(queue: &StatusQueue) -> VecDeque<StatusChange> {
    let mut guard = match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::take(&mut *guard)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invalid_handle_is_not_valid() {
        assert!(!ConnectionHandle::INVALID.is_valid());
        assert!(ConnectionHandle(1).is_valid());
    }

    #[test]
    fn queue_listener_appends_in_order() {
        let queue = new_status_queue();
        let listener = queue_listener(&queue);
        for i in 1..=3u32 {
            listener(StatusChange {
                handle: ConnectionHandle(i),
                peer: PeerIdentity::new(77),
                state: RelayConnectionState::Connecting,
                end_reason: 0,
                debug: String::new(),
            });
        }
        let drained = drain_status_queue(&queue);
        let handles = drained.iter().map(|s| s.handle.0).collect::<Vec<_>>();
        assert_eq!(handles, vec![1, 2, 3]);
        assert!(drain_status_queue(&queue).is_empty());
    }
}
