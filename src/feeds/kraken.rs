//! Kraken spot v2 book feed

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::Feed;
use crate::error::Result;
use crate::parser::{object_levels, BookDecoder, BookEvent, BookUpdate};

pub const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";

/// Public Kraken spot market session
#[derive(Debug, Clone)]
pub struct KrakenSpotFeed {
    ws_url: String,
}

impl KrakenSpotFeed {
    pub fn new() -> Self {
        Self::with_url(KRAKEN_WS_URL)
    }

    pub fn with_url(ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
        }
    }

    /// Book subscription for `symbol` (e.g. `BTC/USD`) at `depth` levels
    pub fn book(symbol: &str, depth: u32) -> Value {
        json!({
            "channel": "book",
            "symbol": [symbol],
            "depth": depth,
        })
    }
}

impl Default for KrakenSpotFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Feed for KrakenSpotFeed {
    fn name(&self) -> &'static str {
        "kraken"
    }

    async fn endpoint(&self) -> Result<String> {
        Ok(self.ws_url.clone())
    }

    fn subscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"method": "subscribe", "params": descriptor}).to_string())
    }

    fn unsubscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"method": "unsubscribe", "params": descriptor}).to_string())
    }

    fn is_control(&self, raw: &str) -> bool {
        raw.contains(r#""channel":"heartbeat""#)
    }
}

/// Decodes `book` channel snapshots and updates.
///
/// The checksum stands in for the sequence. Snapshots carry no timestamp, so
/// both kinds are stamped with the receive time. Stamping updates with the
/// exchange clock would order them against a local snapshot stamp and drop
/// any update the exchange issued before the snapshot arrived.
#[derive(Debug, Default, Clone, Copy)]
pub struct KrakenBookDecoder;

impl BookDecoder for KrakenBookDecoder {
    fn decode(&self, raw: &str) -> Option<Vec<BookEvent>> {
        let msg: Value = serde_json::from_str(raw).ok()?;
        if msg.get("channel")?.as_str()? != "book" {
            return None;
        }
        let is_snapshot = match msg.get("type")?.as_str()? {
            "snapshot" => true,
            "update" => false,
            _ => return None,
        };

        let events = msg
            .get("data")?
            .as_array()?
            .iter()
            .filter_map(|entry| {
                let update = BookUpdate {
                    symbol: entry.get("symbol")?.as_str()?.to_string(),
                    sequence: entry.get("checksum").and_then(Value::as_i64).unwrap_or(0),
                    bids: object_levels(entry.get("bids"), "price", "qty"),
                    asks: object_levels(entry.get("asks"), "price", "qty"),
                    observed_at: Utc::now(),
                };
                Some(if is_snapshot {
                    BookEvent::Snapshot(update)
                } else {
                    BookEvent::Delta(update)
                })
            })
            .collect();
        Some(events)
    }
}
