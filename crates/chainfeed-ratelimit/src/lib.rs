//! chainfeed-ratelimit: admission control for the chainfeed gateway.
//!
//! Four interchangeable algorithms, all usable behind [`Limiter`]:
//!
//! - [`TokenBucketLimiter`]: per-identity token buckets, in-process
//! - [`FixedWindowLimiter`]: epoch-aligned counters in a shared [`CounterStore`]
//! - [`SlidingWindowLimiter`]: weighted previous + current window counters
//! - [`AdaptiveLimiter`]: token bucket that doubles the cost under high load
//!
//! The distributed limiters fail open by default when their backend errors
//! (see [`FailurePolicy`]).

pub mod adaptive;
pub mod config;
pub mod error;
pub mod fixed_window;
pub mod identity;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;

use async_trait::async_trait;

pub use adaptive::AdaptiveLimiter;
pub use config::{AdaptiveConfig, BucketConfig, FailurePolicy, RegistryConfig, WindowConfig};
pub use error::{RateLimitError, StoreError};
pub use fixed_window::FixedWindowLimiter;
pub use identity::{Identity, Rejection, API_KEY_HEADER};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowState};
pub use store::{CounterStore, MemoryCounterStore};
pub use token_bucket::TokenBucketLimiter;

/// Common admission interface.
///
/// `allow` never fails: backend errors are resolved by the limiter's
/// failure policy and logged.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Charge one request to `identity`; `true` if it is admitted.
    async fn allow(&self, identity: &str) -> bool;

    /// Short algorithm name for logs.
    fn name(&self) -> &'static str;
}
