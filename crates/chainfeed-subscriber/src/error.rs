//! Subscriber error types.

use thiserror::Error;

/// Errors raised while connecting to or listening on the upstream node.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// TCP/TLS/WebSocket handshake failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// Handshake did not complete in time.
    #[error("handshake with {url} timed out after {ms}ms")]
    HandshakeTimeout { url: String, ms: u64 },

    /// The subscription request could not be written.
    #[error("failed to send subscription request: {0}")]
    Subscribe(String),

    /// The connection dropped and reconnection is disabled.
    #[error("upstream connection lost: {0}")]
    Disconnected(String),

    /// Every reconnect attempt failed.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("subscriber already started")]
    AlreadyStarted,

    /// The listen task panicked or was aborted.
    #[error("listen task failed: {0}")]
    Task(String),
}

impl SubscriberError {
    /// Returns `true` for transport failures a reconnect may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::HandshakeTimeout { .. } | Self::Subscribe(_) | Self::Disconnected(_)
        )
    }

    /// Returns `true` if the subscriber has stopped for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. } | Self::Task(_))
    }
}
