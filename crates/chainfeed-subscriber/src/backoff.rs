//! Exponential reconnect backoff.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Stateless policy: computes the delay before each reconnect attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub config: BackoffConfig,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th reconnect (1-based), or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_attempts {
            return None;
        }
        let base_ms = self.config.initial.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// The full delay schedule.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..).map_while(|attempt| self.next_delay(attempt))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
