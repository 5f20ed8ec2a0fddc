//! chainfeed-subscriber: keeps a live `NewBlock` subscription to an upstream
//! node and turns notifications into [`BlockEvent`](chainfeed_core::BlockEvent)s.
//!
//! # Usage
//! ```no_run
//! use chainfeed_subscriber::{ChainSubscriber, SubscriberConfig};
//!
//! # async fn run() -> Result<(), chainfeed_subscriber::SubscriberError> {
//! let mut sub = ChainSubscriber::new(SubscriberConfig::new("ws://localhost:26657/websocket"));
//! let mut blocks = sub.events().expect("events taken once");
//! sub.start().await?;
//! while let Some(block) = blocks.recv().await {
//!     println!("block {} with {} txs", block.height, block.tx_count());
//! }
//! sub.stop().await
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod parse;
pub mod subscriber;

pub use backoff::ReconnectPolicy;
pub use config::{BackoffConfig, SubscriberConfig};
pub use error::SubscriberError;
pub use subscriber::ChainSubscriber;
