//! chainfeed-core: shared types for the chainfeed real-time data plane.
//!
//! - [`Topic`]: broadcast categories clients subscribe to
//! - [`ChainEvent`]: the discriminated union of broadcastable events
//! - [`BlockEvent`]: block metadata decoded by the upstream subscriber

pub mod event;
pub mod topic;

pub use event::{BlockEvent, ChainEvent};
pub use topic::{Topic, UnknownTopic};
