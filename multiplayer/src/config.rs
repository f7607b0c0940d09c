use crate::path_cache::DEFAULT_REOFFER_INTERVAL;
use std::time::Duration;

/// Tunables for the coordinator and the bundled UDP host.
///
/// A config is consumed when the multiplayer instance starts, so nothing in
/// here can change while it is serving.
#[derive(Debug, Clone)]
pub struct MultiplayerConfig {
    /// Relay client-to-client traffic through the server and gossip peer
    /// membership to clients.
    pub server_relay: bool,
    /// Capacity of the transport → coordinator event queue.
    pub packet_queue_size: usize,
    pub max_clients: usize,
    pub refuse_connections: bool,
    /// Silence after which the server considers a peer gone.
    pub peer_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How long a client waits for the server to accept it.
    pub connect_timeout: Duration,
    /// Upper bound on a single coordinator wait for transport events.
    pub poll_timeout: Duration,
    /// Wait before an unanswered SimplifyPath is sent again.
    pub path_reoffer_interval: Duration,
}

impl Default for MultiplayerConfig {
    fn default() -> Self {
        Self {
            server_relay: true,
            packet_queue_size: 1024,
            max_clients: 1024,
            refuse_connections: false,
            peer_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(100),
            path_reoffer_interval: DEFAULT_REOFFER_INTERVAL,
        }
    }
}

impl MultiplayerConfig {
    pub fn with_server_relay(mut self, enabled: bool) -> Self {
        self.server_relay = enabled;
        self
    }

    pub fn with_packet_queue_size(mut self, size: usize) -> Self {
        self.packet_queue_size = size.max(1);
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }
}
