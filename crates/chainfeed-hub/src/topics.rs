//! Lock-free per-client topic set.

use std::sync::atomic::{AtomicU32, Ordering};

use chainfeed_core::Topic;

/// Bitset of subscribed topics.
///
/// Written only by the owning client's reader; read by the coordinator
/// during fan-out.
#[derive(Debug, Default)]
pub struct TopicSet(AtomicU32);

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the topic was not already present.
    pub fn insert(&self, topic: Topic) -> bool {
        self.0.fetch_or(topic.bit(), Ordering::AcqRel) & topic.bit() == 0
    }

    /// Returns `true` if the topic was present.
    pub fn remove(&self, topic: Topic) -> bool {
        self.0.fetch_and(!topic.bit(), Ordering::AcqRel) & topic.bit() != 0
    }

    pub fn contains(&self, topic: Topic) -> bool {
        self.0.load(Ordering::Acquire) & topic.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn topics(&self) -> Vec<Topic> {
        Topic::ALL.into_iter().filter(|t| self.contains(*t)).collect()
    }
}
