use crate::identity::PeerIdentity;
use crate::relay::ConnectionHandle;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Why and how a connection ended. Set exactly once by whichever teardown
/// path wins the race.
#[derive(Clone, Debug)]
pub struct CloseInfo {
    pub reason: i32,
    pub debug: String,
}

/// One peer association, shared between the owning adapter and the host as
/// `Arc<Connection>`.
///
/// The adapter that created the connection exclusively owns its lifecycle;
/// everything else only reads it. The two one-shot flags make teardown and
/// the Disconnected event idempotent no matter how many paths (timeout, peer
/// close, local close, send failure) race for them.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    peer: PeerIdentity,
    disconnected: AtomicBool,
    disconnect_event_emitted: AtomicBool,
    close_info: OnceLock<CloseInfo>,
}

impl Connection {
    pub(crate) fn new(handle: ConnectionHandle, peer: PeerIdentity) -> Self {
        Connection {
            handle,
            peer,
            disconnected: AtomicBool::new(false),
            disconnect_event_emitted: AtomicBool::new(false),
            close_info: OnceLock::new(),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Flip to disconnected. Returns true for exactly one caller; that caller
    /// owns releasing the native resources.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    /// Claim the right to fire the Disconnected event. Returns true exactly
    /// once.
    pub(crate) fn mark_event_emitted(&self) -> bool {
        !self.disconnect_event_emitted.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_close_info(&self, reason: i32, debug: &str) {
        let _ = self.close_info.set(CloseInfo { reason, debug: debug.to_string() });
    }

    pub fn close_info(&self) -> Option<&CloseInfo> {
        self.close_info.get()
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection({})", self.peer)
    }
}
