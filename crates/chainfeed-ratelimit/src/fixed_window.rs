//! Distributed fixed-window counter.
//!
//! Each identity gets one counter per epoch-aligned window, keyed
//! `ratelimit:{identity}:{window index}`. The first increment sets an expiry
//! of two windows so abandoned counters clean themselves up.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::config::WindowConfig;
use crate::error::RateLimitError;
use crate::store::CounterStore;
use crate::Limiter;

/// Time since the unix epoch.
pub(crate) fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Index of the epoch-aligned window containing `now`.
pub(crate) fn window_index(now: Duration, window: Duration) -> u128 {
    now.as_millis() / window.as_millis().max(1)
}

pub(crate) fn validate(config: &WindowConfig) -> Result<(), RateLimitError> {
    if config.window.as_millis() == 0 {
        return Err(RateLimitError::InvalidConfig(
            "window must be at least 1ms".into(),
        ));
    }
    Ok(())
}

/// Fixed-window limiter over a shared [`CounterStore`].
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    config: WindowConfig,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: WindowConfig) -> Result<Self, RateLimitError> {
        validate(&config)?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    fn key(identity: &str, index: u128) -> String {
        format!("ratelimit:{identity}:{index}")
    }

    /// Count this request and report whether it fits the window.
    ///
    /// Backend errors are returned as-is; [`Limiter::allow`] applies the
    /// failure policy.
    pub async fn try_allow(&self, identity: &str) -> Result<bool, RateLimitError> {
        self.try_allow_at(identity, unix_now()).await
    }

    /// As [`try_allow`](Self::try_allow) with an explicit clock reading.
    pub async fn try_allow_at(&self, identity: &str, now: Duration) -> Result<bool, RateLimitError> {
        let key = Self::key(identity, window_index(now, self.config.window));
        let count = self
            .store
            .increment(&key)
            .await
            .map_err(|e| RateLimitError::store(&key, e))?;
        if count == 1 {
            if let Err(e) = self.store.expire(&key, self.config.window * 2).await {
                tracing::warn!(key = %key, error = %e, "failed to set window expiry");
            }
        }
        Ok(count <= self.config.limit as i64)
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    async fn allow(&self, identity: &str) -> bool {
        match self.try_allow(identity).await {
            Ok(allowed) => allowed,
            Err(e) => {
                let allowed = self.config.failure_policy.allows();
                tracing::warn!(
                    identity,
                    error = %e,
                    allowed,
                    "fixed window backend failed, applying failure policy"
                );
                allowed
            }
        }
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}
