//! Test harness for driving real client and server sockets against each
//! other over the in-memory relay fabric.

use log::*;
use tether_socket::relay::mock::{MemoryRelay, MemoryRelayNetwork};
use tether_socket::{
    AcceptPolicy, Client, ClientState, PeerIdentity, RecordingHandler, Server, SocketConfig,
};

/// One shared fabric plus factories for endpoints on it.
pub struct TestNet {
    net: MemoryRelayNetwork,
    config: SocketConfig,
}

impl Default for TestNet {
    fn default() -> Self {
        TestNet::new()
    }
}

impl TestNet {
    pub fn new() -> Self {
        env_logger_init();
        TestNet { net: MemoryRelayNetwork::new(), config: SocketConfig::default() }
    }

    pub fn fabric(&self) -> &MemoryRelayNetwork {
        &self.net
    }

    /// A listening server endpoint with the given identity.
    pub fn server(&self, id: u64, policy: Option<Box<dyn AcceptPolicy>>) -> ServerEnd {
        let peer = PeerIdentity::new(id);
        let mut server = Server::new(self.net.endpoint(peer), self.config.clone(), policy);
        server.listen().expect("server should be able to listen on the fabric");
        info!("Test server {peer} is listening");
        ServerEnd { server, events: RecordingHandler::new(), peer }
    }

    /// A fresh (not yet connected) client endpoint with the given identity.
    pub fn client(&self, id: u64) -> ClientEnd {
        let peer = PeerIdentity::new(id);
        let client = Client::new(self.net.endpoint(peer), self.config.clone());
        ClientEnd { client, events: RecordingHandler::new(), peer }
    }
}

pub struct ServerEnd {
    pub server: Server<MemoryRelay>,
    pub events: RecordingHandler,
    pub peer: PeerIdentity,
}

impl ServerEnd {
    pub fn tick(&mut self) {
        self.server.tick(&mut self.events);
    }
}

pub struct ClientEnd {
    pub client: Client<MemoryRelay>,
    pub events: RecordingHandler,
    pub peer: PeerIdentity,
}

impl ClientEnd {
    pub fn tick(&mut self) {
        self.client.tick(&mut self.events);
    }

    pub fn is_connected(&self) -> bool {
        self.client.state() == ClientState::Connected
    }
}

/// Run both update loops for a few rounds, the way two game instances would
/// interleave. Status changes need one round to queue and one to drain, so
/// most scenarios settle within two or three rounds.
pub fn pump(server: &mut ServerEnd, clients: &mut [&mut ClientEnd], rounds: usize) {
    for _ in 0..rounds {
        server.tick();
        for client in clients.iter_mut() {
            client.tick();
        }
    }
}

fn env_logger_init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
