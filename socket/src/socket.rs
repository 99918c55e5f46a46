use crate::channel::Channel;
use crate::client::Client;
use crate::config::SocketConfig;
use crate::connection::Connection;
use crate::errors::SocketError;
use crate::events::{AcceptPolicy, SocketHandler};
use crate::identity::PeerIdentity;
use crate::relay::RelaySockets;
use crate::server::Server;
use log::*;
use std::sync::Arc;

/// A role-agnostic socket: the uniform surface the host framework drives.
///
/// Wraps either a [`Client`] or a [`Server`]; the shared operations (`tick`,
/// `send`, `flush`, `shutdown`) dispatch to whichever role is inside, while
/// `connect` and `listen` fail with `InvalidState` on the wrong role.
pub enum RelaySocket<R: RelaySockets> {
    Client(Client<R>),
    Server(Server<R>),
}

impl<R: RelaySockets> RelaySocket<R> {
    pub fn connect(&mut self, peer: PeerIdentity) -> Result<Arc<Connection>, SocketError> {
        match self {
            RelaySocket::Client(client) => client.connect(peer),
            RelaySocket::Server(_) => {
                Err(SocketError::InvalidState("connect is only valid on a client socket"))
            }
        }
    }

    pub fn listen(&mut self) -> Result<(), SocketError> {
        match self {
            RelaySocket::Client(_) => {
                Err(SocketError::InvalidState("listen is only valid on a server socket"))
            }
            RelaySocket::Server(server) => server.listen(),
        }
    }

    pub fn tick<H: SocketHandler>(&mut self, handler: &mut H) {
        match self {
            RelaySocket::Client(client) => client.tick(handler),
            RelaySocket::Server(server) => server.tick(handler),
        }
    }

    pub fn send(
        &mut self,
        connection: &Arc<Connection>,
        payload: &[u8],
        channel: Channel,
    ) -> Result<(), SocketError> {
        match self {
            RelaySocket::Client(client) => client.send_to(connection, payload, channel),
            RelaySocket::Server(server) => server.send(connection, payload, channel),
        }
    }

    pub fn flush(&mut self) {
        match self {
            RelaySocket::Client(client) => client.flush(),
            RelaySocket::Server(server) => server.flush(),
        }
    }

    pub fn shutdown(&mut self) {
        debug!("Closing socket");
        match self {
            RelaySocket::Client(client) => client.shutdown(),
            RelaySocket::Server(server) => server.shutdown(),
        }
    }
}

/// Builds sockets over a shared relay backend with one configuration.
pub struct SocketFactory<R: RelaySockets + Clone> {
    relay: R,
    config: SocketConfig,
}

impl<R: RelaySockets + Clone> SocketFactory<R> {
    pub fn new(relay: R, config: SocketConfig) -> Self {
        SocketFactory { relay, config }
    }

    /// The largest payload sockets from this factory will accept.
    pub fn max_packet_size(&self) -> usize {
        self.config.effective_packet_size()
    }

    pub fn client_socket(&self) -> RelaySocket<R> {
        RelaySocket::Client(Client::new(self.relay.clone(), self.config.clone()))
    }

    /// A server socket screening inbound attempts with `policy` (accept-all
    /// when `None`). The policy must be in place before `listen` is called.
    pub fn server_socket(&self, policy: Option<Box<dyn AcceptPolicy>>) -> RelaySocket<R> {
        RelaySocket::Server(Server::new(self.relay.clone(), self.config.clone(), policy))
    }

    /// Parse a host address as used by the host framework: the peer's
    /// decimal 64-bit relay identity.
    pub fn parse_endpoint(address: &str) -> Result<PeerIdentity, SocketError> {
        let peer = address.parse::<PeerIdentity>()?;
        Ok(peer)
    }
}

#[cfg(all(test, feature = "mock_relay"))]
mod test {
    use super::*;
    use crate::relay::mock::MemoryRelayNetwork;

    #[test]
    fn endpoint_parsing_matches_identity_rules() {
        let peer = SocketFactory::<crate::relay::mock::MemoryRelay>::parse_endpoint("12345").unwrap();
        assert_eq!(peer, PeerIdentity::new(12345));
        assert!(SocketFactory::<crate::relay::mock::MemoryRelay>::parse_endpoint("0").is_err());
        assert!(SocketFactory::<crate::relay::mock::MemoryRelay>::parse_endpoint("steam").is_err());
    }

    #[test]
    fn role_mismatch_is_an_invalid_operation() {
        let net = MemoryRelayNetwork::new();
        let factory = SocketFactory::new(net.endpoint(PeerIdentity::new(7)), SocketConfig::default());
        let mut client = factory.client_socket();
        let mut server = factory.server_socket(None);
        assert!(matches!(client.listen(), Err(SocketError::InvalidState(_))));
        assert!(matches!(server.connect(PeerIdentity::new(8)), Err(SocketError::InvalidState(_))));
    }
}
