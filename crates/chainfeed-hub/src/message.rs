//! Wire frames exchanged with clients.
//!
//! Server → client: `{"type":"<topic>","data":<payload>,"timestamp":"<rfc3339>"}`
//! and `{"type":"pong","timestamp":...}`.
//!
//! Client → server: `subscribe` / `unsubscribe` carrying `{"type":"<topic>"}`
//! (the key may also be spelled `"Type"`), and `ping`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainfeed_core::Topic;

use crate::error::HubError;

/// Serialized frame shared by every recipient.
pub type Frame = Arc<str>;

#[derive(Debug, Serialize)]
struct ServerFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
    timestamp: DateTime<Utc>,
}

/// One broadcast: its topic and the frame every subscriber receives.
///
/// Built once per broadcast call and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub topic: Topic,
    pub frame: Frame,
}

impl BroadcastMessage {
    pub fn new(topic: Topic, payload: &Value) -> Result<Self, HubError> {
        Self::at(topic, payload, Utc::now())
    }

    pub fn at(topic: Topic, payload: &Value, timestamp: DateTime<Utc>) -> Result<Self, HubError> {
        let frame = serde_json::to_string(&ServerFrame {
            kind: topic.as_str(),
            data: Some(payload),
            timestamp,
        })?;
        Ok(Self {
            topic,
            frame: frame.into(),
        })
    }
}

/// `{"type":"pong","timestamp":...}`
pub fn pong_frame() -> Frame {
    let frame = ServerFrame {
        kind: "pong",
        data: None,
        timestamp: Utc::now(),
    };
    serde_json::to_string(&frame)
        .map(Frame::from)
        .unwrap_or_else(|_| Frame::from(r#"{"type":"pong"}"#))
}

/// Topic selector inside a subscribe/unsubscribe frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TopicRequest {
    #[serde(rename = "type", alias = "Type")]
    pub topic: Topic,
}

/// Frames a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribe { data: TopicRequest },
    Unsubscribe { data: TopicRequest },
    Ping,
}

impl ControlFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
