//! Load-adaptive limiter.
//!
//! Wraps a [`TokenBucketLimiter`] and a system load reading in `0.0..=1.0`.
//! Above the high-load threshold every request must pass the bucket twice,
//! halving effective throughput.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::config::{AdaptiveConfig, BucketConfig, RegistryConfig};
use crate::token_bucket::TokenBucketLimiter;
use crate::Limiter;

pub struct AdaptiveLimiter {
    bucket: TokenBucketLimiter,
    config: AdaptiveConfig,
    /// f64 bits of the current load.
    load: AtomicU64,
}

impl AdaptiveLimiter {
    pub fn new(bucket: BucketConfig, config: AdaptiveConfig) -> Self {
        Self::with_bucket(TokenBucketLimiter::with_registry(bucket, RegistryConfig::default()), config)
    }

    pub fn with_bucket(bucket: TokenBucketLimiter, config: AdaptiveConfig) -> Self {
        Self {
            bucket,
            load: AtomicU64::new(config.initial_load.clamp(0.0, 1.0).to_bits()),
            config,
        }
    }

    /// Record the current system load. Values are clamped to `0.0..=1.0`;
    /// NaN is ignored.
    pub fn set_load(&self, load: f64) {
        if load.is_nan() {
            return;
        }
        self.load.store(load.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.load.load(Ordering::Relaxed))
    }

    pub fn is_high_load(&self) -> bool {
        self.load() > self.config.high_load_threshold
    }

    /// Admit `identity` according to the current load.
    pub fn try_acquire(&self, identity: &str) -> bool {
        if self.is_high_load() {
            // Two successive checks; the first token stays spent on rejection.
            self.bucket.try_acquire(identity) && self.bucket.try_acquire(identity)
        } else {
            self.bucket.try_acquire(identity)
        }
    }

    pub fn bucket(&self) -> &TokenBucketLimiter {
        &self.bucket
    }
}

#[async_trait]
impl Limiter for AdaptiveLimiter {
    async fn allow(&self, identity: &str) -> bool {
        self.try_acquire(identity)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}
