//! Order book module
//!
//! Maintains a local mirror of each subscribed symbol's ladders from feed
//! snapshots and deltas.

mod book;
mod store;

pub use book::SymbolBook;
pub use store::OrderBookStore;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Prices are keyed as `price * 10^8` to keep ladder keys exact
pub const PRICE_SCALE: i64 = 100_000_000;
const PRICE_SCALE_DIGITS: u32 = 8;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// Convert a price into its ladder key, rounding half away from zero.
///
/// Returns `None` for non-positive prices and prices that do not fit an `i64`
/// once scaled.
pub fn price_key(price: Decimal) -> Option<i64> {
    if price <= Decimal::ZERO {
        return None;
    }
    price
        .checked_mul(Decimal::from(PRICE_SCALE))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Recover the price a ladder key stands for
pub fn key_price(key: i64) -> Decimal {
    Decimal::new(key, PRICE_SCALE_DIGITS).normalize()
}

/// A single level in a published depth snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthRecord {
    pub price: Decimal,
    pub quantity: f64,
}

/// Point-in-time copy of one symbol's book.
///
/// Bids are strictly descending by price, asks strictly ascending, and every
/// quantity is positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: i64,
    pub bids: Vec<DepthRecord>,
    pub asks: Vec<DepthRecord>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<&DepthRecord> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthRecord> {
        self.asks.first()
    }

    /// Average of best bid and best ask
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::from(2)),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }
}
