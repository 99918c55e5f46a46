use crate::identity::IdentityError;
use crate::relay::RelayError;
use thiserror::Error;

/// Host-facing failures. Fail-soft conditions (double disconnect, operations
/// after disconnect) are logged and swallowed rather than surfaced here.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The host called an operation in a state where it is not valid. Always
    /// indicates host-side misuse, never a network condition.
    #[error("Invalid operation: {0}")]
    InvalidState(&'static str),
    #[error("Peer identity is invalid. {0}")]
    InvalidPeer(#[from] IdentityError),
    #[error("Payload of {size} bytes exceeds the maximum packet size of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Relay service error. {0}")]
    Relay(#[from] RelayError),
}
