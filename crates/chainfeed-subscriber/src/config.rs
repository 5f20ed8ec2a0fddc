//! Subscriber configuration.

use std::time::Duration;

/// Default CometBFT query for new blocks.
pub const NEW_BLOCK_QUERY: &str = "tm.event='NewBlock'";

/// Reconnect backoff settings.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

/// Configuration for [`ChainSubscriber`](crate::ChainSubscriber).
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Upstream WebSocket endpoint, e.g. `ws://localhost:26657/websocket`.
    pub url: String,
    /// Event query sent with the subscribe request.
    pub query: String,
    /// Bound on connect + WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Reconnect after the connection drops.
    pub reconnect: bool,
    pub backoff: BackoffConfig,
    /// Capacity of the decoded event queue.
    pub channel_capacity: usize,
}

impl SubscriberConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:26657/websocket".into(),
            query: NEW_BLOCK_QUERY.into(),
            handshake_timeout: Duration::from_secs(10),
            reconnect: true,
            backoff: BackoffConfig::default(),
            channel_capacity: 100,
        }
    }
}
