//! Shared counter backend used by the distributed window limiters.
//!
//! A production deployment points this at a cache shared by every API
//! instance; [`MemoryCounterStore`] is the single-process implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StoreError;

/// Minimal counter operations the window limiters need.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value of `key`, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Atomically add one to `key` (creating it at 0) and return the new value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Expire `key` after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process counter store with expiry.
///
/// Expired keys read as absent and are dropped lazily or via
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove every expired key. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.lock();
        let before = counters.len();
        counters.retain(|_, c| c.is_live(now));
        before - counters.len()
    }

    /// Number of keys held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = Instant::now();
        let mut counters = self.lock();
        match counters.get(key) {
            Some(c) if c.is_live(now) => Ok(Some(c.value)),
            Some(_) => {
                counters.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut counters = self.lock();
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        if !counter.is_live(now) {
            *counter = Counter {
                value: 0,
                expires_at: None,
            };
        }
        counter.value += 1;
        Ok(counter.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        if let Some(counter) = self.lock().get_mut(key) {
            counter.expires_at = Some(now + ttl);
        }
        Ok(())
    }
}
