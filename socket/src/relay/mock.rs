//! An in-memory relay fabric implementing [`RelaySockets`].
//!
//! Lets any number of endpoints, addressed by [`PeerIdentity`], dial each
//! other inside one process: the test double for the real relay backend.
//! Status listeners are invoked on whichever thread called the triggering
//! primitive, after every fabric lock has been dropped. That matches the
//! "foreign thread, no re-entrancy" discipline of the real service, which is
//! what the adapters' queue-and-drain design is built against.

use crate::identity::PeerIdentity;
use crate::relay::{
    ConnectOptions, ConnectionHandle, ListenOptions, ListenSocket, PollGroup, RelayConnectionState,
    RelayError, RelayMessage, RelaySockets, SendOutcome, StatusChange, StatusListener,
    StatusSubscription, RELAY_MAX_MESSAGE_SIZE,
};
use log::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// End reason used when a dial finds no listen socket at the target.
pub const END_MISC_NO_LISTENER: i32 = 5003;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum LinkPhase {
    /// Created by a dial, awaiting the listening side's accept.
    Pending,
    Established,
    /// The other side closed; this half lingers until its owner closes it.
    Closed,
}

/// One half of a connection, owned by a single endpoint.
struct Link {
    owner: PeerIdentity,
    remote: PeerIdentity,
    remote_handle: ConnectionHandle,
    phase: LinkPhase,
    /// Messages waiting to be received on this handle.
    inbox: VecDeque<Vec<u8>>,
    /// Messages sent while still Pending; flushed to the peer on establish.
    sent_while_pending: Vec<Vec<u8>>,
    poll_group: Option<PollGroup>,
}

#[derive(Default)]
struct Endpoint {
    listeners: HashMap<u64, StatusListener>,
    listen_socket: Option<ListenSocket>,
    access_denied: bool,
}

#[derive(Default)]
struct Fabric {
    next_id: u32,
    next_subscription: u64,
    endpoints: HashMap<PeerIdentity, Endpoint>,
    links: HashMap<ConnectionHandle, Link>,
    messages_delivered: usize,
    messages_released: usize,
}

type Callbacks = Vec<(StatusListener, StatusChange)>;

impl Fabric {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn endpoint_mut(&mut self, peer: PeerIdentity) -> &mut Endpoint {
        self.endpoints.entry(peer).or_default()
    }

    /// Collect (never invoke) the callbacks for a notification; the caller
    /// runs them once the fabric lock is gone.
    fn notify(&self, target: PeerIdentity, change: StatusChange, out: &mut Callbacks) {
        if let Some(endpoint) = self.endpoints.get(&target) {
            for listener in endpoint.listeners.values() {
                out.push((Arc::clone(listener), change.clone()));
            }
        }
    }
}

/// The shared fabric. Clone-cheap; create one per test or process and hand
/// out endpoints from it.
#[derive(Clone, Default)]
pub struct MemoryRelayNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl MemoryRelayNetwork {
    pub fn new() -> Self {
        MemoryRelayNetwork::default()
    }

    /// The relay capability set as seen by `peer`.
    pub fn endpoint(&self, peer: PeerIdentity) -> MemoryRelay {
        self.lock().endpoint_mut(peer);
        MemoryRelay { fabric: Arc::clone(&self.fabric), local: peer }
    }

    /// Make capability negotiation fail for `peer`.
    pub fn deny_relay_access(&self, peer: PeerIdentity) {
        self.lock().endpoint_mut(peer).access_denied = true;
    }

    /// Received messages whose payload memory has not been released back.
    /// Zero whenever the adapters are between ticks; anything else is a leak.
    pub fn outstanding_messages(&self) -> usize {
        let fabric = self.lock();
        fabric.messages_delivered - fabric.messages_released
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        match self.fabric.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One endpoint's handle onto the fabric.
#[derive(Clone)]
pub struct MemoryRelay {
    fabric: Arc<Mutex<Fabric>>,
    local: PeerIdentity,
}

impl MemoryRelay {
    pub fn local_peer(&self) -> PeerIdentity {
        self.local
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        match self.fabric.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn run(callbacks: Callbacks) {
        for (listener, change) in callbacks {
            listener(change);
        }
    }
}

impl RelaySockets for MemoryRelay {
    fn init_relay_network_access(&self) -> Result<(), RelayError> {
        let mut fabric = self.lock();
        if fabric.endpoint_mut(self.local).access_denied {
            return Err(RelayError::AccessDenied);
        }
        Ok(())
    }

    fn register_status_listener(&self, listener: StatusListener) -> StatusSubscription {
        let mut fabric = self.lock();
        fabric.next_subscription += 1;
        let id = fabric.next_subscription;
        fabric.endpoint_mut(self.local).listeners.insert(id, listener);
        StatusSubscription(id)
    }

    fn release_subscription(&self, subscription: StatusSubscription) {
        let mut fabric = self.lock();
        fabric.endpoint_mut(self.local).listeners.remove(&subscription.0);
    }

    fn connect_p2p(
        &self,
        peer: PeerIdentity,
        _options: &ConnectOptions,
    ) -> Result<ConnectionHandle, RelayError> {
        let mut callbacks = Callbacks::new();
        let handle = {
            let mut fabric = self.lock();
            let local_handle = ConnectionHandle(fabric.alloc_id());
            let remote_handle = ConnectionHandle(fabric.alloc_id());
            let listening = fabric
                .endpoints
                .get(&peer)
                .map(|endpoint| endpoint.listen_socket.is_some())
                .unwrap_or(false);
            if listening {
                fabric.links.insert(
                    local_handle,
                    Link {
                        owner: self.local,
                        remote: peer,
                        remote_handle,
                        phase: LinkPhase::Pending,
                        inbox: VecDeque::new(),
                        sent_while_pending: Vec::new(),
                        poll_group: None,
                    },
                );
                fabric.links.insert(
                    remote_handle,
                    Link {
                        owner: peer,
                        remote: self.local,
                        remote_handle: local_handle,
                        phase: LinkPhase::Pending,
                        inbox: VecDeque::new(),
                        sent_while_pending: Vec::new(),
                        poll_group: None,
                    },
                );
                fabric.notify(
                    peer,
                    StatusChange {
                        handle: remote_handle,
                        peer: self.local,
                        state: RelayConnectionState::Connecting,
                        end_reason: 0,
                        debug: String::new(),
                    },
                    &mut callbacks,
                );
            } else {
                debug!("Dial from {} to {peer} found no listen socket", self.local);
                fabric.notify(
                    self.local,
                    StatusChange {
                        handle: local_handle,
                        peer,
                        state: RelayConnectionState::ProblemDetectedLocally,
                        end_reason: END_MISC_NO_LISTENER,
                        debug: "no listen socket at peer".to_string(),
                    },
                    &mut callbacks,
                );
            }
            local_handle
        };
        Self::run(callbacks);
        Ok(handle)
    }

    fn create_listen_socket(&self, _options: &ListenOptions) -> Result<ListenSocket, RelayError> {
        let mut fabric = self.lock();
        let socket = ListenSocket(fabric.alloc_id());
        let endpoint = fabric.endpoint_mut(self.local);
        if endpoint.listen_socket.is_some() {
            warn!("Endpoint {} already had a listen socket; replacing it", self.local);
        }
        endpoint.listen_socket = Some(socket);
        Ok(socket)
    }

    fn close_listen_socket(&self, socket: ListenSocket) {
        let mut fabric = self.lock();
        let endpoint = fabric.endpoint_mut(self.local);
        if endpoint.listen_socket == Some(socket) {
            endpoint.listen_socket = None;
        }
    }

    fn create_poll_group(&self) -> PollGroup {
        let mut fabric = self.lock();
        PollGroup(fabric.alloc_id())
    }

    fn destroy_poll_group(&self, group: PollGroup) {
        let mut fabric = self.lock();
        for link in fabric.links.values_mut() {
            if link.owner == self.local && link.poll_group == Some(group) {
                link.poll_group = None;
            }
        }
    }

    fn set_connection_poll_group(
        &self,
        handle: ConnectionHandle,
        group: Option<PollGroup>,
    ) -> bool {
        let mut fabric = self.lock();
        match fabric.links.get_mut(&handle) {
            Some(link) if link.owner == self.local => {
                link.poll_group = group;
                true
            }
            _ => false,
        }
    }

    fn accept_connection(&self, handle: ConnectionHandle) -> Result<(), RelayError> {
        let mut callbacks = Callbacks::new();
        {
            let mut fabric = self.lock();
            let (remote, remote_handle) = match fabric.links.get(&handle) {
                None => return Err(RelayError::InvalidHandle),
                Some(link) if link.owner != self.local => {
                    return Err(RelayError::Internal("not the accepting side".to_string()))
                }
                Some(link) if link.phase != LinkPhase::Pending => {
                    return Err(RelayError::Internal("connection is not pending".to_string()))
                }
                Some(link) => (link.remote, link.remote_handle),
            };
            // Establish both halves and flush anything sent while pending.
            let queued_local = {
                let link = fabric.links.get_mut(&handle).expect("checked above");
                link.phase = LinkPhase::Established;
                std::mem::take(&mut link.sent_while_pending)
            };
            let queued_remote = match fabric.links.get_mut(&remote_handle) {
                Some(link) => {
                    link.phase = LinkPhase::Established;
                    link.inbox.extend(queued_local);
                    std::mem::take(&mut link.sent_while_pending)
                }
                None => Vec::new(),
            };
            if let Some(link) = fabric.links.get_mut(&handle) {
                link.inbox.extend(queued_remote);
            }
            fabric.notify(
                self.local,
                StatusChange {
                    handle,
                    peer: remote,
                    state: RelayConnectionState::Connected,
                    end_reason: 0,
                    debug: String::new(),
                },
                &mut callbacks,
            );
            fabric.notify(
                remote,
                StatusChange {
                    handle: remote_handle,
                    peer: self.local,
                    state: RelayConnectionState::Connected,
                    end_reason: 0,
                    debug: String::new(),
                },
                &mut callbacks,
            );
        }
        Self::run(callbacks);
        Ok(())
    }

    fn close_connection(
        &self,
        handle: ConnectionHandle,
        reason: i32,
        debug: &str,
        _linger: bool,
    ) -> bool {
        let mut callbacks = Callbacks::new();
        let closed = {
            let mut fabric = self.lock();
            match fabric.links.remove(&handle) {
                None => false,
                Some(link) => {
                    let notify_peer = match fabric.links.get_mut(&link.remote_handle) {
                        Some(peer_link) if peer_link.phase != LinkPhase::Closed => {
                            peer_link.phase = LinkPhase::Closed;
                            true
                        }
                        _ => false,
                    };
                    if notify_peer {
                        fabric.notify(
                            link.remote,
                            StatusChange {
                                handle: link.remote_handle,
                                peer: link.owner,
                                state: RelayConnectionState::ClosedByPeer,
                                end_reason: reason,
                                debug: debug.to_string(),
                            },
                            &mut callbacks,
                        );
                    }
                    true
                }
            }
        };
        Self::run(callbacks);
        closed
    }

    fn send_message(&self, handle: ConnectionHandle, payload: &[u8], _flags: i32) -> SendOutcome {
        if payload.len() > RELAY_MAX_MESSAGE_SIZE {
            return SendOutcome::InvalidParam;
        }
        let mut fabric = self.lock();
        let (phase, remote_handle) = match fabric.links.get(&handle) {
            None => return SendOutcome::NoConnection,
            Some(link) => (link.phase, link.remote_handle),
        };
        match phase {
            LinkPhase::Closed => SendOutcome::NoConnection,
            LinkPhase::Pending => {
                let link = fabric.links.get_mut(&handle).expect("checked above");
                link.sent_while_pending.push(payload.to_vec());
                SendOutcome::Ok
            }
            LinkPhase::Established => match fabric.links.get_mut(&remote_handle) {
                Some(peer_link) => {
                    peer_link.inbox.push_back(payload.to_vec());
                    SendOutcome::Ok
                }
                None => SendOutcome::NoConnection,
            },
        }
    }

    fn receive_on_connection(
        &self,
        handle: ConnectionHandle,
        max: usize,
        out: &mut Vec<RelayMessage>,
    ) -> usize {
        let mut fabric = self.lock();
        let mut taken = 0;
        if let Some(link) = fabric.links.get_mut(&handle) {
            while taken < max {
                match link.inbox.pop_front() {
                    Some(payload) => {
                        out.push(RelayMessage { connection: handle, payload });
                        taken += 1;
                    }
                    None => break,
                }
            }
        }
        fabric.messages_delivered += taken;
        taken
    }

    fn receive_on_poll_group(
        &self,
        group: PollGroup,
        max: usize,
        out: &mut Vec<RelayMessage>,
    ) -> usize {
        let mut fabric = self.lock();
        let mut members = fabric
            .links
            .iter()
            .filter(|(_, link)| link.owner == self.local && link.poll_group == Some(group))
            .map(|(handle, _)| *handle)
            .collect::<Vec<_>>();
        members.sort();
        let mut taken = 0;
        'outer: for handle in members {
            if let Some(link) = fabric.links.get_mut(&handle) {
                while let Some(payload) = link.inbox.pop_front() {
                    out.push(RelayMessage { connection: handle, payload });
                    taken += 1;
                    if taken == max {
                        break 'outer;
                    }
                }
            }
        }
        fabric.messages_delivered += taken;
        taken
    }

    fn release_message(&self, message: RelayMessage) {
        let mut fabric = self.lock();
        fabric.messages_released += 1;
        drop(message);
    }

    fn flush_connection(&self, handle: ConnectionHandle) {
        trace!("Flush requested for {handle}; the fabric delivers eagerly");
    }
}
