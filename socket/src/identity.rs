use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

/// Opaque 64-bit peer identity assigned by the relay platform.
///
/// Identities are pre-validated by the relay service; the adapter only ever
/// compares and forwards them. Zero is reserved and never names a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(u64);

impl PeerIdentity {
    pub const INVALID: PeerIdentity = PeerIdentity(0);

    pub const fn new(id: u64) -> Self {
        PeerIdentity(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl Display for PeerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim().parse::<u64>()?;
        if id == 0 {
            return Err(IdentityError::Reserved);
        }
        Ok(PeerIdentity(id))
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Peer identity is not a decimal 64-bit id. {0}")]
    Malformed(#[from] ParseIntError),
    #[error("Peer identity 0 is reserved")]
    Reserved,
}
