//! Hub error types.

use chainfeed_core::Topic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// The coordinator has stopped; nothing more will be delivered.
    #[error("hub is closed")]
    Closed,

    /// The coordinator mailbox is full; the broadcast was dropped.
    #[error("hub mailbox full, dropped {topic} broadcast")]
    Backlogged { topic: Topic },

    /// `run` was called on a hub whose coordinator is already running.
    #[error("hub coordinator already running")]
    AlreadyRunning,

    /// A payload could not be serialized into a frame.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HubError {
    /// Returns `true` if the hub will not accept further commands.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
