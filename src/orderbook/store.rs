//! Local order book store
//!
//! One independently locked book per symbol. The table itself is a sharded
//! map, so locking one symbol never blocks readers or writers of another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{DepthSnapshot, SymbolBook};
use crate::error::{FeedError, Result};
use crate::parser::{BookEvent, PriceLevel};

/// Order books for every symbol seen on a feed
#[derive(Debug, Default)]
pub struct OrderBookStore {
    books: DashMap<String, Arc<Mutex<SymbolBook>>>,
}

impl OrderBookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to a symbol's book, created on first use
    fn book(&self, symbol: &str) -> Arc<Mutex<SymbolBook>> {
        if let Some(book) = self.books.get(symbol) {
            return book.value().clone();
        }
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolBook::new(symbol))))
            .value()
            .clone()
    }

    /// Run `f` against an existing symbol's book while holding its lock
    fn with_book<R>(&self, symbol: &str, f: impl FnOnce(&mut SymbolBook) -> R) -> Option<R> {
        let book = self.books.get(symbol).map(|book| book.value().clone())?;
        let mut guard = book.lock();
        Some(f(&mut guard))
    }

    /// Replace a symbol's ladders with a full snapshot
    pub fn apply_snapshot(
        &self,
        symbol: &str,
        sequence: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        observed_at: DateTime<Utc>,
    ) {
        let book = self.book(symbol);
        let mut guard = book.lock();
        guard.apply_snapshot(sequence, bids, asks, observed_at);
    }

    /// Merge a delta into a symbol's ladders.
    ///
    /// Returns false if the delta predates the symbol's last snapshot.
    pub fn apply_delta(
        &self,
        symbol: &str,
        sequence: i64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        observed_at: DateTime<Utc>,
    ) -> bool {
        let book = self.book(symbol);
        let mut guard = book.lock();
        guard.apply_delta(sequence, bids, asks, observed_at)
    }

    /// Apply a parsed feed event
    pub fn apply(&self, event: &BookEvent) -> bool {
        match event {
            BookEvent::Snapshot(update) => {
                self.apply_snapshot(
                    &update.symbol,
                    update.sequence,
                    &update.bids,
                    &update.asks,
                    update.observed_at,
                );
                true
            }
            BookEvent::Delta(update) => self.apply_delta(
                &update.symbol,
                update.sequence,
                &update.bids,
                &update.asks,
                update.observed_at,
            ),
        }
    }

    /// Point-in-time copy of a symbol's book
    pub fn snapshot(&self, symbol: &str) -> Result<DepthSnapshot> {
        self.with_book(symbol, |book| book.depth())
            .flatten()
            .ok_or_else(|| FeedError::NotReady(symbol.to_string()))
    }

    pub fn is_ready(&self, symbol: &str) -> bool {
        self.with_book(symbol, |book| book.is_ready())
            .unwrap_or(false)
    }

    pub fn sequence(&self, symbol: &str) -> Option<i64> {
        self.with_book(symbol, |book| book.sequence())
    }

    /// Raw `(bid, ask)` entry counts, tombstones included
    pub fn level_counts(&self, symbol: &str) -> Option<(usize, usize)> {
        self.with_book(symbol, |book| book.level_counts())
    }

    /// Symbols with a book in the store
    pub fn symbols(&self) -> Vec<String> {
        self.books.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop a symbol's book, typically after unsubscribing from it
    pub fn remove(&self, symbol: &str) -> bool {
        self.books.remove(symbol).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::thread;

    fn level(price: Decimal, quantity: f64) -> PriceLevel {
        PriceLevel { price, quantity }
    }

    #[test]
    fn test_snapshot_not_ready() {
        let store = OrderBookStore::new();
        assert_eq!(
            store.snapshot("XBT/USD"),
            Err(FeedError::NotReady("XBT/USD".to_string()))
        );

        store.apply_delta("XBT/USD", 1, &[level(dec!(1), 1.0)], &[], Utc::now());
        assert!(!store.is_ready("XBT/USD"));
        assert!(matches!(
            store.snapshot("XBT/USD"),
            Err(FeedError::NotReady(_))
        ));
    }

    #[test]
    fn test_snapshot_authority_over_stale_deltas() {
        let store = OrderBookStore::new();
        let now = Utc::now();
        let bids = [level(dec!(100), 1.0), level(dec!(99), 0.0), level(dec!(98), 3.0)];
        let asks = [level(dec!(101), 2.0)];
        store.apply_snapshot("ETH/USD", 42, &bids, &asks, now);

        for i in 1..=5 {
            let applied = store.apply_delta(
                "ETH/USD",
                42 + i,
                &[level(dec!(100), 0.0), level(dec!(97), 5.0)],
                &[level(dec!(101), 9.0)],
                now - Duration::milliseconds(i),
            );
            assert!(!applied);
        }

        let depth = store.snapshot("ETH/USD").unwrap();
        assert_eq!(depth.sequence, 42);
        let bid_prices: Vec<Decimal> = depth.bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(100), dec!(98)]);
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(depth.asks[0].quantity, 2.0);
    }

    #[test]
    fn test_snapshot_replaces_rather_than_merges() {
        let store = OrderBookStore::new();
        let now = Utc::now();
        store.apply_snapshot("ETH/USD", 1, &[level(dec!(100), 1.0)], &[], now);
        store.apply_delta("ETH/USD", 2, &[level(dec!(95), 1.0)], &[], now);
        store.apply_snapshot(
            "ETH/USD",
            3,
            &[level(dec!(90), 1.0)],
            &[level(dec!(110), 1.0)],
            now + Duration::seconds(1),
        );

        let depth = store.snapshot("ETH/USD").unwrap();
        assert_eq!(depth.bids.len(), 1);
        assert_eq!(depth.bids[0].price, dec!(90));
    }

    #[test]
    fn test_removal_is_idempotent() {
        let store = OrderBookStore::new();
        let now = Utc::now();
        store.apply_snapshot(
            "SOL/USD",
            1,
            &[level(dec!(20), 1.0), level(dec!(19), 1.0)],
            &[level(dec!(21), 1.0)],
            now,
        );

        store.apply_delta("SOL/USD", 2, &[level(dec!(18), 0.0)], &[], now);
        assert_eq!(store.level_counts("SOL/USD"), Some((2, 1)));

        store.apply_delta("SOL/USD", 3, &[level(dec!(19), 0.0)], &[], now);
        let once = store.snapshot("SOL/USD").unwrap();
        store.apply_delta("SOL/USD", 3, &[level(dec!(19), 0.0)], &[], now);
        let twice = store.snapshot("SOL/USD").unwrap();

        assert_eq!(once.bids, twice.bids);
        assert_eq!(once.asks, twice.asks);
    }

    #[test]
    fn test_compaction_trigger() {
        let store = OrderBookStore::new();
        let now = Utc::now();
        let bids: Vec<PriceLevel> = (1..=5i64).map(|p| level(Decimal::from(p), 1.0)).collect();
        let asks: Vec<PriceLevel> = (11..=15i64).map(|p| level(Decimal::from(p), 1.0)).collect();
        store.apply_snapshot("ADA/USD", 1, &bids, &asks, now);

        // 2 of 10 tombstoned: kept
        store.apply_delta("ADA/USD", 2, &[level(dec!(1), 0.0), level(dec!(2), 0.0)], &[], now);
        store.snapshot("ADA/USD").unwrap();
        assert_eq!(store.level_counts("ADA/USD"), Some((5, 5)));

        // 3 of 10 tombstoned sits exactly on the ratio: kept
        store.apply_delta("ADA/USD", 3, &[], &[level(dec!(11), 0.0)], now);
        let depth = store.snapshot("ADA/USD").unwrap();
        assert_eq!(depth.bids.len(), 3);
        assert_eq!(depth.asks.len(), 4);
        assert_eq!(store.level_counts("ADA/USD"), Some((5, 5)));

        // 4 of 10 tombstoned: purged
        store.apply_delta("ADA/USD", 4, &[], &[level(dec!(12), 0.0)], now);
        let depth = store.snapshot("ADA/USD").unwrap();
        assert_eq!(depth.bids.len(), 3);
        assert_eq!(depth.asks.len(), 3);
        assert_eq!(store.level_counts("ADA/USD"), Some((3, 3)));
    }

    #[test]
    fn test_remove_and_symbols() {
        let store = OrderBookStore::new();
        let now = Utc::now();
        store.apply_snapshot("A", 1, &[], &[], now);
        store.apply_snapshot("B", 1, &[], &[], now);
        let mut symbols = store.symbols();
        symbols.sort();
        assert_eq!(symbols, vec!["A".to_string(), "B".to_string()]);

        assert!(store.remove("A"));
        assert!(!store.remove("A"));
        assert!(store.sequence("A").is_none());
        assert_eq!(store.sequence("B"), Some(1));
    }

    #[test]
    fn test_concurrent_readers_never_see_half_applied_delta() {
        let store = Arc::new(OrderBookStore::new());
        let now = Utc::now();
        store.apply_snapshot(
            "BTC/USD",
            0,
            &[level(dec!(100), 1.0)],
            &[level(dec!(101), 1.0)],
            now,
        );

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 1..=500i64 {
                        let qty = (w * 1000 + i) as f64;
                        store.apply_delta(
                            "BTC/USD",
                            i,
                            &[level(dec!(100), qty)],
                            &[level(dec!(101), qty)],
                            now,
                        );
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let depth = store.snapshot("BTC/USD").unwrap();
                        assert_eq!(depth.bids[0].quantity, depth.asks[0].quantity);
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_apply_event() {
        use crate::parser::BookUpdate;

        let store = OrderBookStore::new();
        let update = BookUpdate {
            symbol: "BTCUSDT".to_string(),
            sequence: 9,
            bids: vec![level(dec!(1), 1.0)],
            asks: vec![],
            observed_at: Utc::now(),
        };
        assert!(store.apply(&BookEvent::Snapshot(update.clone())));
        assert!(store.apply(&BookEvent::Delta(update)));
        assert_eq!(store.sequence("BTCUSDT"), Some(9));
    }
}
