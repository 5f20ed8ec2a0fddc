//! JSON-RPC framing for the upstream node.
//!
//! Inbound notifications look like:
//!
//! ```text
//! {"result":{"data":{"value":{
//!     "block":{"header":{"height":"42","time":"...","proposer_address":"...","chain_id":"..."},
//!              "data":{"txs":["..."]}},
//!     "block_id":{"hash":"..."}}}}}
//! ```

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use chainfeed_core::BlockEvent;

/// Request id used for the subscription call.
pub const SUBSCRIBE_ID: u64 = 1;

/// Build the `subscribe` request for `query`.
pub fn subscribe_request(query: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "subscribe",
        "id": SUBSCRIBE_ID,
        "params": { "query": query }
    })
}

/// Decode one text frame. Returns `None` for anything that is not a block
/// notification; malformed JSON is logged.
pub fn decode_frame(text: &str) -> Option<BlockEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed upstream frame");
            return None;
        }
    };
    parse_block(&value)
}

/// Extract a [`BlockEvent`] from a decoded notification.
pub fn parse_block(value: &Value) -> Option<BlockEvent> {
    let inner = value.pointer("/result/data/value")?;
    let block = inner.get("block").filter(|b| b.is_object())?;
    let header = &block["header"];

    let height = match &header["height"] {
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Number(n) => n.as_u64().unwrap_or(0),
        _ => 0,
    };
    let time = header["time"]
        .as_str()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let txs = block
        .pointer("/data/txs")
        .and_then(Value::as_array)
        .map(|txs| {
            txs.iter()
                .filter_map(|tx| tx.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Some(BlockEvent {
        height,
        hash: string_at(inner, "/block_id/hash"),
        chain_id: string_at(header, "/chain_id"),
        time,
        proposer: string_at(header, "/proposer_address"),
        txs,
    })
}

fn string_at(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
