use crate::relay::RELAY_MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum packet size. Well under the relay's own ceiling: 1280 MTU
/// minus the ipv4/udp/relay headers, so single packets never fragment.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1198;

/// Tunables for a client or server socket. All fields have workable defaults,
/// so hosts usually only override the ones their framework exposes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// How long a client dial may stay in Connecting before it is abandoned.
    pub connect_timeout: Duration,
    /// Largest payload accepted by `send`. Clamped to the relay ceiling.
    pub max_packet_size: usize,
    /// Disable the relay's Nagle-style batching on sends. The host framework
    /// already controls packet flow, so batching underneath it only adds
    /// latency.
    pub no_nagle: bool,
    /// Receive buffers allocated up front.
    pub pool_prewarm: usize,
    /// Receive buffers retained for reuse; releases beyond this are dropped.
    pub pool_max_retained: usize,
    /// Largest batch drained from the relay per tick.
    pub max_messages_per_poll: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            connect_timeout: Duration::from_secs(60),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            no_nagle: true,
            pool_prewarm: 100,
            pool_max_retained: 1000,
            max_messages_per_poll: 256,
        }
    }
}

impl SocketConfig {
    /// The connect timeout with the 1-second floor applied. A shorter timeout
    /// would expire before the relay has a chance to pick a route.
    pub fn effective_timeout(&self) -> Duration {
        self.connect_timeout.max(Duration::from_secs(1))
    }

    /// The packet size limit with the relay ceiling applied.
    pub fn effective_packet_size(&self) -> usize {
        self.max_packet_size.min(RELAY_MAX_MESSAGE_SIZE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_has_a_one_second_floor() {
        let mut config = SocketConfig::default();
        config.connect_timeout = Duration::from_millis(10);
        assert_eq!(config.effective_timeout(), Duration::from_secs(1));
        config.connect_timeout = Duration::from_secs(30);
        assert_eq!(config.effective_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn packet_size_is_clamped_to_the_relay_ceiling() {
        let mut config = SocketConfig::default();
        config.max_packet_size = 10 * 1024 * 1024;
        assert_eq!(config.effective_packet_size(), RELAY_MAX_MESSAGE_SIZE);
        config.max_packet_size = 1198;
        assert_eq!(config.effective_packet_size(), 1198);
    }

    #[test]
    fn partial_config_round_trips_with_defaults() {
        let config: SocketConfig = serde_json::from_str(r#"{ "no_nagle": false }"#).unwrap();
        assert!(!config.no_nagle);
        assert_eq!(config.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        let text = serde_json::to_string(&config).unwrap();
        let back: SocketConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
