//! chainfeed-hub: fan-out of chain events to WebSocket subscribers.
//!
//! A single coordinator task owns the client registry. Producers call
//! [`Hub::broadcast`] (or one of the typed helpers), which enqueue a shared
//! [`BroadcastMessage`] without waiting. The coordinator hands the frame to
//! each subscribed client's bounded queue with `try_send`; a client that
//! cannot keep up is disconnected rather than slowing everyone else down.

pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod message;
pub mod topics;

pub use client::Connection;
pub use config::HubConfig;
pub use error::HubError;
pub use hub::{ClientHandle, ClientId, Hub};
pub use message::{BroadcastMessage, ControlFrame, Frame, TopicRequest};
pub use topics::TopicSet;
