//! Per-symbol ladder state
//!
//! Uses BTreeMap so extraction walks levels already in price order.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{key_price, price_key, DepthRecord, DepthSnapshot, Side};
use crate::parser::PriceLevel;

/// Share of tombstoned levels above which extraction purges them
const COMPACTION_RATIO: f64 = 0.3;

/// Ladder state for a single symbol
#[derive(Debug)]
pub struct SymbolBook {
    symbol: String,
    /// Bids keyed by scaled price, highest first
    bids: BTreeMap<Reverse<i64>, f64>,
    /// Asks keyed by scaled price, lowest first
    asks: BTreeMap<i64, f64>,
    /// Sequence or checksum reported by the feed
    sequence: i64,
    last_update: Option<DateTime<Utc>>,
    /// Observation time of the last applied snapshot; `None` until one arrives
    snapshot_at: Option<DateTime<Utc>>,
}

impl SymbolBook {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: 0,
            last_update: None,
            snapshot_at: None,
        }
    }

    /// Replace both ladders wholesale
    pub fn apply_snapshot(
        &mut self,
        sequence: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        observed_at: DateTime<Utc>,
    ) {
        self.bids.clear();
        self.asks.clear();

        for level in bids {
            if let Some(key) = usable_key(level) {
                if level.quantity > 0.0 {
                    self.bids.insert(Reverse(key), level.quantity);
                }
            }
        }

        for level in asks {
            if let Some(key) = usable_key(level) {
                if level.quantity > 0.0 {
                    self.asks.insert(key, level.quantity);
                }
            }
        }

        self.sequence = sequence;
        self.last_update = Some(observed_at);
        self.snapshot_at = Some(observed_at);
    }

    /// Merge changed levels into the ladders.
    ///
    /// Returns false when the delta was observed before the last snapshot and
    /// was therefore dropped. No sequence continuity check is made.
    pub fn apply_delta(
        &mut self,
        sequence: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        observed_at: DateTime<Utc>,
    ) -> bool {
        if matches!(self.snapshot_at, Some(at) if observed_at < at) {
            return false;
        }

        for level in bids {
            self.update_side(Side::Bid, level);
        }

        for level in asks {
            self.update_side(Side::Ask, level);
        }

        self.sequence = sequence;
        self.last_update = Some(observed_at);
        true
    }

    /// Update a single price level; zero quantity tombstones an existing level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        let Some(key) = usable_key(level) else {
            return;
        };
        match side {
            Side::Bid => {
                if level.quantity == 0.0 {
                    if let Some(qty) = self.bids.get_mut(&Reverse(key)) {
                        *qty = 0.0;
                    }
                } else {
                    self.bids.insert(Reverse(key), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity == 0.0 {
                    if let Some(qty) = self.asks.get_mut(&key) {
                        *qty = 0.0;
                    }
                } else {
                    self.asks.insert(key, level.quantity);
                }
            }
        }
    }

    /// Whether a snapshot has ever been applied
    pub fn is_ready(&self) -> bool {
        self.snapshot_at.is_some()
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Raw `(bid, ask)` entry counts, tombstones included
    pub fn level_counts(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Copy the live levels out, purging tombstones once they exceed the
    /// compaction ratio.
    pub fn depth(&mut self) -> Option<DepthSnapshot> {
        let timestamp = self.last_update.filter(|_| self.is_ready())?;

        let mut zero_count = 0usize;
        let bids: Vec<DepthRecord> = self
            .bids
            .iter()
            .filter_map(|(Reverse(key), qty)| {
                if *qty > 0.0 {
                    Some(DepthRecord {
                        price: key_price(*key),
                        quantity: *qty,
                    })
                } else {
                    zero_count += 1;
                    None
                }
            })
            .collect();
        let asks: Vec<DepthRecord> = self
            .asks
            .iter()
            .filter_map(|(key, qty)| {
                if *qty > 0.0 {
                    Some(DepthRecord {
                        price: key_price(*key),
                        quantity: *qty,
                    })
                } else {
                    zero_count += 1;
                    None
                }
            })
            .collect();

        let total = self.bids.len() + self.asks.len();
        if total > 0 && zero_count as f64 / total as f64 > COMPACTION_RATIO {
            self.bids.retain(|_, qty| *qty > 0.0);
            self.asks.retain(|_, qty| *qty > 0.0);
        }

        Some(DepthSnapshot {
            symbol: self.symbol.clone(),
            timestamp,
            sequence: self.sequence,
            bids,
            asks,
        })
    }
}

fn usable_key(level: &PriceLevel) -> Option<i64> {
    if !level.quantity.is_finite() || level.quantity < 0.0 {
        return None;
    }
    price_key(level.price)
}
