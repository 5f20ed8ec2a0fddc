//! Gateway configuration file.
//!
//! A single JSON document; every field has a default, so `{}` is a valid
//! configuration. Durations are given in milliseconds or seconds as the
//! field name says.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use chainfeed_hub::HubConfig;
use chainfeed_ratelimit::{AdaptiveConfig, BucketConfig, FailurePolicy, RegistryConfig, WindowConfig};
use chainfeed_subscriber::{BackoffConfig, SubscriberConfig};

use crate::logging::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the WebSocket endpoint binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: UpstreamConfig::default(),
            hub: HubSection::default(),
            rate_limit: RateLimitConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("invalid gateway configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// Upstream node subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Set to false to run the hub without an upstream feed.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "bool_true")]
    pub reconnect: bool,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn bool_true() -> bool { true }
fn default_upstream_url() -> String { "ws://localhost:26657/websocket".into() }
fn default_query() -> String { chainfeed_subscriber::config::NEW_BLOCK_QUERY.into() }
fn default_handshake_timeout_ms() -> u64 { 10_000 }
fn default_backoff_initial_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 30_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_attempts() -> u32 { 10 }
fn default_channel_capacity() -> usize { 100 }

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_upstream_url(),
            query: default_query(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            reconnect: true,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl UpstreamConfig {
    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            url: self.url.clone(),
            query: self.query.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            reconnect: self.reconnect,
            backoff: BackoffConfig {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                multiplier: self.backoff_multiplier,
                max_attempts: self.max_attempts,
            },
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Broadcast hub tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_queue")]
    pub command_capacity: usize,
    #[serde(default = "default_queue")]
    pub client_queue_capacity: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_handshake_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_queue() -> usize { 256 }
fn default_heartbeat_secs() -> u64 { 30 }
fn default_pong_timeout_secs() -> u64 { 60 }
fn default_write_timeout_secs() -> u64 { 10 }
fn default_handshake_secs() -> u64 { 10 }
fn default_max_message_size() -> usize { 512 }

impl Default for HubSection {
    fn default() -> Self {
        Self {
            command_capacity: default_queue(),
            client_queue_capacity: default_queue(),
            heartbeat_secs: default_heartbeat_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            handshake_timeout_secs: default_handshake_secs(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl HubSection {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.command_capacity,
            client_queue_capacity: self.client_queue_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_message_size: self.max_message_size,
        }
    }
}

/// Which limiter guards the upgrade endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    Adaptive,
    Disabled,
}

/// Admission control for WebSocket upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Token bucket capacity as a multiple of `requests_per_window`.
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,
    /// Overrides the refill interval derived from the window budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_interval_ms: Option<u64>,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_max_identities")]
    pub max_identities: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: f64,
    /// Connected clients that count as full load for the adaptive limiter.
    #[serde(default = "default_load_capacity")]
    pub load_capacity: usize,
}

fn default_requests_per_window() -> u64 { 60 }
fn default_window_secs() -> u64 { 60 }
fn default_burst_multiplier() -> f64 { 1.0 }
fn default_cleanup_interval_secs() -> u64 { 300 }
fn default_stale_after_secs() -> u64 { 3_600 }
fn default_max_identities() -> usize { 10_000 }
fn default_high_load_threshold() -> f64 { 0.8 }
fn default_load_capacity() -> usize { 10_000 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            burst_multiplier: default_burst_multiplier(),
            refill_interval_ms: None,
            cleanup_interval_secs: default_cleanup_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            max_identities: default_max_identities(),
            failure_policy: FailurePolicy::default(),
            high_load_threshold: default_high_load_threshold(),
            load_capacity: default_load_capacity(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn bucket_config(&self) -> BucketConfig {
        let mut bucket =
            BucketConfig::per_window(self.requests_per_window, self.window(), self.burst_multiplier);
        if let Some(ms) = self.refill_interval_ms {
            bucket.refill_interval = Duration::from_millis(ms);
        }
        bucket
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            max_identities: self.max_identities,
        }
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            limit: self.requests_per_window,
            window: self.window(),
            failure_policy: self.failure_policy,
        }
    }

    pub fn adaptive_config(&self) -> AdaptiveConfig {
        AdaptiveConfig {
            high_load_threshold: self.high_load_threshold,
            ..AdaptiveConfig::default()
        }
    }
}
