//! Weighted sliding-window counter.
//!
//! Approximates a true sliding window from two fixed-window counters: the
//! previous window's count is weighted by the share of it that still
//! overlaps the sliding window.
//!
//! ```text
//! weighted = floor(previous * (1 - progress)) + current
//! progress = elapsed into current window / window size
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::WindowConfig;
use crate::error::RateLimitError;
use crate::fixed_window::{unix_now, validate, window_index};
use crate::store::CounterStore;
use crate::Limiter;

/// Counts observed for one identity at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowState {
    pub previous: i64,
    pub current: i64,
}

impl SlidingWindowState {
    /// Weighted request count at `progress` (0.0..=1.0) through the current window.
    pub fn weighted(&self, progress: f64) -> i64 {
        let progress = progress.clamp(0.0, 1.0);
        (self.previous as f64 * (1.0 - progress)).floor() as i64 + self.current
    }
}

/// Fraction of the current window already elapsed at `now`.
pub fn window_progress(now: Duration, window: Duration) -> f64 {
    let window_ms = window.as_millis().max(1);
    (now.as_millis() % window_ms) as f64 / window_ms as f64
}

/// Sliding-window limiter over a shared [`CounterStore`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    config: WindowConfig,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: WindowConfig) -> Result<Self, RateLimitError> {
        validate(&config)?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    fn key(identity: &str, index: u128) -> String {
        format!("ratelimit:sw:{identity}:{index}")
    }

    pub async fn try_allow(&self, identity: &str) -> Result<bool, RateLimitError> {
        self.try_allow_at(identity, unix_now()).await
    }

    /// Count this request at `now` and compare the weighted total to the limit.
    pub async fn try_allow_at(&self, identity: &str, now: Duration) -> Result<bool, RateLimitError> {
        let state = self.observe(identity, now).await?;
        let weighted = state.weighted(window_progress(now, self.config.window));
        tracing::trace!(
            identity,
            previous = state.previous,
            current = state.current,
            weighted,
            "sliding window check"
        );
        Ok(weighted <= self.config.limit as i64)
    }

    /// Increment the current window and read the previous one.
    async fn observe(&self, identity: &str, now: Duration) -> Result<SlidingWindowState, RateLimitError> {
        let index = window_index(now, self.config.window);
        let current_key = Self::key(identity, index);

        let current = self
            .store
            .increment(&current_key)
            .await
            .map_err(|e| RateLimitError::store(&current_key, e))?;
        if current == 1 {
            if let Err(e) = self.store.expire(&current_key, self.config.window * 2).await {
                tracing::warn!(key = %current_key, error = %e, "failed to set window expiry");
            }
        }

        // A missing or unreadable previous window just weighs nothing.
        let previous = match index.checked_sub(1) {
            Some(prev) => {
                let previous_key = Self::key(identity, prev);
                match self.store.get(&previous_key).await {
                    Ok(count) => count.unwrap_or(0),
                    Err(e) => {
                        tracing::debug!(key = %previous_key, error = %e, "previous window unreadable");
                        0
                    }
                }
            }
            None => 0,
        };

        Ok(SlidingWindowState { previous, current })
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    async fn allow(&self, identity: &str) -> bool {
        match self.try_allow(identity).await {
            Ok(allowed) => allowed,
            Err(e) => {
                let allowed = self.config.failure_policy.allows();
                tracing::warn!(
                    identity,
                    error = %e,
                    allowed,
                    "sliding window backend failed, applying failure policy"
                );
                allowed
            }
        }
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}
