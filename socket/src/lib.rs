//! Tick-driven relay transport for game-networking hosts.
//!
//! This crate adapts an asynchronous, callback-driven relay service into the
//! synchronous bind/connect/send/tick surface a game-networking framework
//! expects. The host calls [`Client::tick`]/[`Server::tick`] once per update
//! cycle and receives its Connected / Data / Disconnected events from inside
//! that call, on its own thread, in a deterministic order.
//!
//! # Architecture
//!
//! Three pieces do the work:
//!
//! - [`Client`] and [`Server`]: the per-role connection state machines. The
//!   client drives a single outbound connection through
//!   Connecting → Connected → Disconnected with a connect deadline; the
//!   server screens inbound attempts through an [`AcceptPolicy`] and
//!   multiplexes every accepted connection over one poll group.
//!
//! - The status queue: the relay delivers connection-status callbacks on a
//!   thread it controls. The registered listener does nothing but append an
//!   immutable [`relay::StatusChange`] snapshot to an append-only queue; the
//!   tick drains it and performs every state transition and event dispatch
//!   itself. Host code is never re-entered from a foreign callback stack.
//!
//! - [`BufferPool`]: inbound payloads are copied out of relay-owned memory
//!   into recycled buffers before the memory is released back to the
//!   service, so the receive hot path does not allocate.
//!
//! The relay itself is abstracted behind [`relay::RelaySockets`]; the
//! `mock_relay` feature (on by default) provides an in-process fabric used
//! by the test suites.

mod buffer;
mod channel;
mod client;
mod config;
mod connection;
pub mod errors;
mod events;
mod identity;
pub mod relay;
mod server;
mod socket;

pub use buffer::{Buffer, BufferPool};
pub use channel::Channel;
pub use client::{Client, ClientState};
pub use config::{SocketConfig, DEFAULT_MAX_PACKET_SIZE};
pub use connection::{CloseInfo, Connection};
pub use errors::SocketError;
pub use events::{
    AcceptPolicy, ConnectionAttempt, RecordedEvent, RecordingHandler, SocketHandler,
};
pub use identity::{IdentityError, PeerIdentity};
pub use server::Server;
pub use socket::{RelaySocket, SocketFactory};
