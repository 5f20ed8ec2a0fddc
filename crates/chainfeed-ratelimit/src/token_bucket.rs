//! Per-identity token bucket limiter.
//!
//! Every identity owns a bucket of `capacity` tokens. One token is added per
//! elapsed `refill_interval` (whole tokens only; the fractional remainder
//! carries over) up to `capacity`. Each admitted request consumes one token.
//!
//! Buckets are created on first use and reclaimed by a background sweep
//! that starts with the limiter and stops when it is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::{BucketConfig, RegistryConfig};
use crate::Limiter;

#[derive(Debug, Clone)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
    last_seen: Instant,
}

impl BucketState {
    fn full(config: &BucketConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, config: &BucketConfig, now: Instant) {
        if config.refill_interval.is_zero() {
            self.tokens = config.capacity;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = (elapsed.as_nanos() / config.refill_interval.as_nanos())
            .min(config.capacity as u128) as u64;
        if periods == 0 {
            return;
        }
        self.tokens = (self.tokens + periods).min(config.capacity);
        if self.tokens == config.capacity {
            self.last_refill = now;
        } else {
            let advanced = config.refill_interval.as_nanos() * periods as u128;
            self.last_refill += Duration::from_nanos(advanced as u64);
        }
    }

    fn try_take(&mut self, cost: u64) -> bool {
        if cost > 0 && self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    fn wait_time(&self, config: &BucketConfig, cost: u64, now: Instant) -> Duration {
        let deficit = cost.saturating_sub(self.tokens);
        if deficit == 0 {
            return Duration::ZERO;
        }
        let next = self.last_refill + config.refill_interval;
        let first = next.saturating_duration_since(now);
        first + config.refill_interval * (deficit - 1).min(u32::MAX as u64) as u32
    }
}

struct BucketRegistry {
    bucket: BucketConfig,
    limits: RegistryConfig,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl BucketRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BucketState>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.lock();
        let before = buckets.len();
        if before > self.limits.max_identities {
            tracing::warn!(
                identities = before,
                cap = self.limits.max_identities,
                "bucket registry over capacity, resetting"
            );
            buckets.clear();
            return before;
        }
        let stale_after = self.limits.stale_after;
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < stale_after);
        let removed = before - buckets.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = buckets.len(), "reclaimed idle buckets");
        }
        removed
    }
}

/// Aborts the sweep task when the owning limiter is dropped.
struct CleanupTask(JoinHandle<()>);

impl CleanupTask {
    /// Spawns the sweep on the current runtime. Outside a runtime no task
    /// is started and callers sweep manually via `cleanup_stale`.
    fn spawn(registry: Weak<BucketRegistry>, every: Duration) -> Option<Self> {
        if every.is_zero() {
            return None;
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        Some(Self(handle.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.sweep();
                    }
                    None => break,
                }
            }
        })))
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Thread-safe token bucket limiter keyed by identity.
pub struct TokenBucketLimiter {
    registry: Arc<BucketRegistry>,
    _cleanup: Option<CleanupTask>,
}

impl TokenBucketLimiter {
    pub fn new(bucket: BucketConfig) -> Self {
        Self::with_registry(bucket, RegistryConfig::default())
    }

    pub fn with_registry(bucket: BucketConfig, limits: RegistryConfig) -> Self {
        let registry = Arc::new(BucketRegistry {
            bucket,
            limits,
            buckets: Mutex::new(HashMap::new()),
        });
        let cleanup = CleanupTask::spawn(Arc::downgrade(&registry), limits.cleanup_interval);
        Self {
            registry,
            _cleanup: cleanup,
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.registry.bucket
    }

    /// Take one token from `identity`'s bucket.
    ///
    /// Returns `false` if the bucket is empty (rate limit exceeded).
    pub fn try_acquire(&self, identity: &str) -> bool {
        self.try_acquire_cost(identity, 1)
    }

    /// Take `cost` tokens at once. Nothing is taken if fewer are available.
    pub fn try_acquire_cost(&self, identity: &str, cost: u64) -> bool {
        let config = &self.registry.bucket;
        let now = Instant::now();
        let mut buckets = self.registry.lock();
        let bucket = buckets
            .entry(identity.to_string())
            .or_insert_with(|| BucketState::full(config, now));
        bucket.refill(config, now);
        bucket.last_seen = now;
        bucket.try_take(cost)
    }

    /// Tokens currently available to `identity` (capacity for unknown identities).
    pub fn available(&self, identity: &str) -> u64 {
        let config = &self.registry.bucket;
        let now = Instant::now();
        let mut buckets = self.registry.lock();
        match buckets.get_mut(identity) {
            Some(bucket) => {
                bucket.refill(config, now);
                bucket.tokens
            }
            None => config.capacity,
        }
    }

    /// Estimated wait before `identity` can be admitted again.
    pub fn retry_after(&self, identity: &str) -> Duration {
        let config = &self.registry.bucket;
        let now = Instant::now();
        let mut buckets = self.registry.lock();
        match buckets.get_mut(identity) {
            Some(bucket) => {
                bucket.refill(config, now);
                bucket.wait_time(config, 1, now)
            }
            None => Duration::ZERO,
        }
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one sweep now. Returns how many identities were dropped.
    pub fn cleanup_stale(&self) -> usize {
        self.registry.sweep()
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("config", &self.registry.bucket)
            .field("identities", &self.len())
            .finish()
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn allow(&self, identity: &str) -> bool {
        self.try_acquire(identity)
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u64, refill_ms: u64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(BucketConfig {
            capacity,
            refill_interval: Duration::from_millis(refill_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_one_token_per_interval() {
        let rl = limiter(5, 100);
        for i in 0..5 {
            assert!(rl.try_acquire("10.0.0.1"), "call {i} should pass");
        }
        assert!(!rl.try_acquire("10.0.0.1"), "6th immediate call must be rejected");

        time::advance(Duration::from_millis(100)).await;
        assert!(rl.try_acquire("10.0.0.1"));
        assert!(!rl.try_acquire("10.0.0.1"), "only one token refilled");
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_independent() {
        let rl = limiter(2, 1_000);
        assert!(rl.try_acquire("a"));
        assert!(rl.try_acquire("a"));
        assert!(!rl.try_acquire("a"));
        assert!(rl.try_acquire("b"));
        assert_eq!(rl.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let rl = limiter(3, 10);
        rl.try_acquire("k");
        time::advance(Duration::from_secs(10)).await;
        assert_eq!(rl.available("k"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_interval_carries_over() {
        let rl = limiter(2, 100);
        assert!(rl.try_acquire("k"));
        assert!(rl.try_acquire("k"));
        time::advance(Duration::from_millis(150)).await;
        assert!(rl.try_acquire("k"));
        // 50ms left over from the previous period
        time::advance(Duration::from_millis(50)).await;
        assert!(rl.try_acquire("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_reports_next_refill() {
        let rl = limiter(1, 100);
        assert_eq!(rl.retry_after("k"), Duration::ZERO);
        rl.try_acquire("k");
        time::advance(Duration::from_millis(30)).await;
        assert_eq!(rl.retry_after("k"), Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_identities() {
        let rl = TokenBucketLimiter::with_registry(
            BucketConfig::default(),
            RegistryConfig {
                cleanup_interval: Duration::ZERO,
                stale_after: Duration::from_secs(3600),
                max_identities: 100,
            },
        );
        rl.try_acquire("old");
        time::advance(Duration::from_secs(1800)).await;
        rl.try_acquire("fresh");
        time::advance(Duration::from_secs(1800)).await;

        assert_eq!(rl.cleanup_stale(), 1);
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.available("fresh"), rl.config().capacity);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_resets_registry_over_cap() {
        let rl = TokenBucketLimiter::with_registry(
            BucketConfig::default(),
            RegistryConfig {
                cleanup_interval: Duration::ZERO,
                stale_after: Duration::from_secs(3600),
                max_identities: 3,
            },
        );
        for ip in ["1", "2", "3", "4"] {
            rl.try_acquire(ip);
        }
        assert_eq!(rl.cleanup_stale(), 4);
        assert!(rl.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_on_interval() {
        let rl = TokenBucketLimiter::with_registry(
            BucketConfig::default(),
            RegistryConfig {
                cleanup_interval: Duration::from_secs(60),
                stale_after: Duration::from_secs(30),
                max_identities: 100,
            },
        );
        rl.try_acquire("idle");
        time::sleep(Duration::from_secs(61)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(rl.is_empty());
    }

    #[test]
    fn works_without_runtime() {
        let rl = limiter(1, 1_000);
        assert!(rl.try_acquire("k"));
        assert!(!rl.try_acquire("k"));
    }
}
