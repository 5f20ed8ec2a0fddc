//! Rate limiter error types.

use thiserror::Error;

/// Errors raised by a [`CounterStore`](crate::store::CounterStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached (connection refused, timeout, ...).
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the distributed limiters before a failure policy is applied.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The shared counter backend failed for `key`.
    #[error("counter store error for {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },

    /// A limiter was built with parameters it cannot enforce.
    #[error("invalid rate limit config: {0}")]
    InvalidConfig(String),
}

impl RateLimitError {
    pub(crate) fn store(key: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            key: key.into(),
            source,
        }
    }

    /// Returns `true` if the error came from the backend rather than from
    /// configuration, i.e. the failure policy applies.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}
