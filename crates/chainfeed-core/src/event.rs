//! Chain events carried from the upstream subscriber to the broadcast hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::topic::Topic;

/// Block-level metadata extracted from a `NewBlock` notification.
///
/// Transactions are kept as the opaque strings the node sent; decoding them
/// is left to downstream indexers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvent {
    /// Block height (0 if the node sent something unparseable).
    pub height: u64,
    /// Block hash from `block_id.hash`, empty when absent.
    #[serde(default)]
    pub hash: String,
    /// Chain identifier from the block header.
    #[serde(default)]
    pub chain_id: String,
    /// Block time. Falls back to the local clock when the header time is invalid.
    pub time: DateTime<Utc>,
    /// Proposer (validator) address.
    pub proposer: String,
    /// Raw encoded transactions, undecoded.
    #[serde(default)]
    pub txs: Vec<String>,
}

impl BlockEvent {
    /// Number of transactions included in the block.
    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }
}

/// A structured event ready for fan-out.
///
/// Each variant maps onto exactly one [`Topic`]. Derived events (swaps,
/// oracle prices, ...) are produced by indexers and carry their payload as
/// opaque JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    NewBlock(BlockEvent),
    Transaction(Value),
    Event(Value),
    DexSwap(Value),
    OraclePrice(Value),
}

impl ChainEvent {
    /// The topic subscribers must hold to receive this event.
    pub fn topic(&self) -> Topic {
        match self {
            Self::NewBlock(_) => Topic::Block,
            Self::Transaction(_) => Topic::Transaction,
            Self::Event(_) => Topic::Event,
            Self::DexSwap(_) => Topic::DexSwap,
            Self::OraclePrice(_) => Topic::OraclePrice,
        }
    }

    /// Serialize the payload into a JSON value.
    pub fn to_payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::NewBlock(block) => serde_json::to_value(block),
            Self::Transaction(v) | Self::Event(v) | Self::DexSwap(v) | Self::OraclePrice(v) => {
                Ok(v.clone())
            }
        }
    }
}

impl From<BlockEvent> for ChainEvent {
    fn from(block: BlockEvent) -> Self {
        Self::NewBlock(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> BlockEvent {
        BlockEvent {
            height: 42,
            hash: "ABCDEF".into(),
            chain_id: "paw-testnet-1".into(),
            time: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            proposer: "pawvaloper1xyz".into(),
            txs: vec!["CpIBCo8B".into(), "CpQBCpEB".into()],
        }
    }

    #[test]
    fn topic_per_variant() {
        assert_eq!(ChainEvent::from(block()).topic(), Topic::Block);
        assert_eq!(ChainEvent::DexSwap(Value::Null).topic(), Topic::DexSwap);
        assert_eq!(ChainEvent::OraclePrice(Value::Null).topic(), Topic::OraclePrice);
    }

    #[test]
    fn block_payload_serializes_metadata() {
        let payload = ChainEvent::from(block()).to_payload().unwrap();
        assert_eq!(payload["height"], 42);
        assert_eq!(payload["proposer"], "pawvaloper1xyz");
        assert_eq!(payload["txs"].as_array().unwrap().len(), 2);
        assert_eq!(block().tx_count(), 2);
    }
}
