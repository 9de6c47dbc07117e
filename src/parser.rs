//! Shared wire types for book messages
//!
//! Feed-specific decoders in [`crate::feeds`] turn raw frames into
//! [`BookEvent`]s built from the helpers here. Level decoding is lenient: a
//! malformed level is dropped and the rest of the payload still applies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Price level (price, quantity pair) as received from a feed
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: f64,
}

/// Levels and metadata carried by a snapshot or delta
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub symbol: String,
    /// Update id, sequence or checksum, depending on the venue
    pub sequence: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub observed_at: DateTime<Utc>,
}

/// A decoded book message
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    Snapshot(BookUpdate),
    Delta(BookUpdate),
}

impl BookEvent {
    pub fn symbol(&self) -> &str {
        match self {
            BookEvent::Snapshot(update) | BookEvent::Delta(update) => &update.symbol,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BookEvent::Snapshot(_) => "snapshot",
            BookEvent::Delta(_) => "delta",
        }
    }
}

/// Decodes a venue's book frames.
///
/// Returns `None` for frames that are not book data; those are passed through
/// to the caller's message sink.
pub trait BookDecoder: Send + Sync {
    fn decode(&self, raw: &str) -> Option<Vec<BookEvent>>;
}

/// Decimal from a JSON string or number
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Float from a JSON string or number
pub fn f64_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Integer from a JSON string or number
pub fn i64_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Levels encoded as `[[price, qty, ...], ...]`
pub fn pair_levels(value: Option<&Value>) -> Vec<PriceLevel> {
    let Some(Value::Array(rows)) = value else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            Some(PriceLevel {
                price: decimal_from_value(row.first()?)?,
                quantity: f64_from_value(row.get(1)?)?,
            })
        })
        .collect()
}

/// Levels encoded as `[{<price_field>: .., <qty_field>: ..}, ...]`
pub fn object_levels(value: Option<&Value>, price_field: &str, qty_field: &str) -> Vec<PriceLevel> {
    let Some(Value::Array(rows)) = value else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            Some(PriceLevel {
                price: decimal_from_value(row.get(price_field)?)?,
                quantity: f64_from_value(row.get(qty_field)?)?,
            })
        })
        .collect()
}

/// Millisecond epoch timestamp, falling back to now when absent or invalid
pub fn millis_or_now(value: Option<&Value>) -> DateTime<Utc> {
    value
        .and_then(i64_from_value)
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}
