use crate::relay::{
    SEND_RELIABLE, SEND_RELIABLE_NO_NAGLE, SEND_UNRELIABLE, SEND_UNRELIABLE_NO_NAGLE,
};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Logical delivery channel exposed to the host framework. Anything finer
/// grained (ordering, sequencing) is the host's concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Reliable,
    Unreliable,
}

impl Channel {
    /// Map the channel to the relay's send-flag bitmask. Pure and total:
    /// every channel has a flag for both nagle settings.
    pub fn to_send_flags(self, no_nagle: bool) -> i32 {
        match (self, no_nagle) {
            (Channel::Reliable, false) => SEND_RELIABLE,
            (Channel::Reliable, true) => SEND_RELIABLE_NO_NAGLE,
            (Channel::Unreliable, false) => SEND_UNRELIABLE,
            (Channel::Unreliable, true) => SEND_UNRELIABLE_NO_NAGLE,
        }
    }

    /// Decode a received flag bitmask. Only the reliable bit decides;
    /// scheduling bits (no-nagle, no-delay) are ignored so any unreliable
    /// variant decodes to `Unreliable`.
    pub fn from_send_flags(flags: i32) -> Channel {
        if flags & SEND_RELIABLE != 0 {
            Channel::Reliable
        } else {
            Channel::Unreliable
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Reliable => f.write_str("Reliable"),
            Channel::Unreliable => f.write_str("Unreliable"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::relay::SEND_UNRELIABLE_NO_DELAY;

    #[test]
    fn flags_round_trip_for_both_nagle_settings() {
        for channel in [Channel::Reliable, Channel::Unreliable] {
            for no_nagle in [false, true] {
                let flags = channel.to_send_flags(no_nagle);
                assert_eq!(Channel::from_send_flags(flags), channel, "{channel} no_nagle={no_nagle}");
            }
        }
    }

    #[test]
    fn scheduling_bits_do_not_change_the_decoded_channel() {
        assert_eq!(Channel::from_send_flags(SEND_UNRELIABLE_NO_DELAY), Channel::Unreliable);
        assert_eq!(Channel::from_send_flags(SEND_RELIABLE_NO_NAGLE), Channel::Reliable);
    }
}
