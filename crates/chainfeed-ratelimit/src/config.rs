//! Limiter configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-identity token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum (and initial) tokens per identity.
    pub capacity: u64,
    /// One token is added per elapsed interval.
    pub refill_interval: Duration,
}

impl BucketConfig {
    /// Derive a bucket from a "N requests per window" budget.
    ///
    /// Capacity is `limit * burst_multiplier` (at least 1) and tokens refill
    /// evenly across the window.
    pub fn per_window(limit: u64, window: Duration, burst_multiplier: f64) -> Self {
        let limit = limit.max(1);
        let capacity = ((limit as f64) * burst_multiplier.max(0.0)).ceil().max(1.0) as u64;
        Self {
            capacity,
            refill_interval: window / limit.min(u32::MAX as u64) as u32,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        // 60 req/min with a burst of 60
        Self {
            capacity: 60,
            refill_interval: Duration::from_secs(1),
        }
    }
}

/// Bounds on locally held per-identity state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryConfig {
    /// How often the background sweep runs.
    pub cleanup_interval: Duration,
    /// Identities idle for at least this long are forgotten.
    pub stale_after: Duration,
    /// Above this many identities the whole registry is reset.
    pub max_identities: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(60 * 60),
            max_identities: 10_000,
        }
    }
}

/// What a distributed limiter answers when its backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request. Availability over strict enforcement.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

impl FailurePolicy {
    pub fn allows(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Parameters for the fixed and sliding window limiters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    /// Requests admitted per window.
    pub limit: u64,
    /// Window length. Windows are aligned to the unix epoch.
    pub window: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::from_secs(60),
            failure_policy: FailurePolicy::Open,
        }
    }
}

/// Parameters for the load-adaptive limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveConfig {
    /// Load above which each request costs two bucket checks.
    pub high_load_threshold: f64,
    /// Load assumed until the first [`set_load`](crate::AdaptiveLimiter::set_load).
    pub initial_load: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            high_load_threshold: 0.8,
            initial_load: 0.5,
        }
    }
}
