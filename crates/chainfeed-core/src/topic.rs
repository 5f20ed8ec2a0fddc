//! Broadcast topics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named category of broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// New committed blocks.
    Block,
    /// Individual transactions.
    Transaction,
    /// Generic module events.
    Event,
    /// DEX swap executions.
    DexSwap,
    /// Oracle price updates.
    OraclePrice,
}

impl Topic {
    /// Every topic, in bit order.
    pub const ALL: [Topic; 5] = [
        Topic::Block,
        Topic::Transaction,
        Topic::Event,
        Topic::DexSwap,
        Topic::OraclePrice,
    ];

    /// Wire name, e.g. `"dex_swap"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Transaction => "transaction",
            Self::Event => "event",
            Self::DexSwap => "dex_swap",
            Self::OraclePrice => "oracle_price",
        }
    }

    /// Single-bit mask for this topic, used by topic sets.
    pub fn bit(&self) -> u32 {
        1 << (*self as u32)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}
