//! Hub configuration.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Tunables for the coordinator and per-client tasks.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Coordinator mailbox size (register / unregister / broadcast / count).
    pub command_capacity: usize,
    /// Outbound frames buffered per client before it is disconnected.
    pub client_queue_capacity: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// A client that sends nothing for this long is considered dead.
    pub pong_timeout: Duration,
    /// Bound on a single frame write.
    pub write_timeout: Duration,
    /// Bound on the server-side upgrade handshake.
    pub handshake_timeout: Duration,
    /// Largest inbound message accepted from a client, in bytes.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            client_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 512,
        }
    }
}

impl HubConfig {
    /// Protocol limits for accepted sockets. Oversized frames fail the read
    /// before they are buffered.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_message_size),
            ..WebSocketConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_limits_follow_max_message_size() {
        let config = HubConfig {
            max_message_size: 1024,
            ..HubConfig::default()
        };
        let ws = config.websocket_config();
        assert_eq!(ws.max_message_size, Some(1024));
        assert_eq!(ws.max_frame_size, Some(1024));
        assert!(!ws.accept_unmasked_frames);
    }
}
