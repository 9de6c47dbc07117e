//! Routes inbound frames between the order book store and a pass-through sink

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::error::{FeedError, Result};
use crate::metrics::BOOK_UPDATES;
use crate::orderbook::OrderBookStore;
use crate::parser::{BookDecoder, BookEvent, BookUpdate};
use crate::websocket::{ErrorSink, LogErrorSink, MessageSink};

/// Out-of-band full book source for feeds whose stream only carries deltas
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, symbol: &str) -> Result<BookUpdate>;
}

/// Deltas held per symbol while its snapshot is in flight
type Pending = Arc<Mutex<HashMap<String, VecDeque<BookUpdate>>>>;

/// Oldest held deltas are dropped past this many per symbol
const MAX_PENDING_DELTAS: usize = 10_000;

/// Message sink that feeds decoded book events into an [`OrderBookStore`]
/// and forwards everything else.
///
/// With a [`SnapshotSource`], deltas for a symbol are held from the moment a
/// resync starts until its snapshot lands, then replayed on top of it.
pub struct BookRouter {
    feed: &'static str,
    decoder: Box<dyn BookDecoder>,
    store: Arc<OrderBookStore>,
    passthrough: Arc<dyn MessageSink>,
    errors: Arc<dyn ErrorSink>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    symbols: Vec<String>,
    pending: Pending,
}

impl BookRouter {
    pub fn new(
        feed: &'static str,
        decoder: impl BookDecoder + 'static,
        store: Arc<OrderBookStore>,
        passthrough: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            feed,
            decoder: Box::new(decoder),
            store,
            passthrough,
            errors: Arc::new(LogErrorSink),
            snapshots: None,
            symbols: Vec::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seed `symbols` from `source` after every (re)connect
    pub fn with_snapshots(mut self, source: Arc<dyn SnapshotSource>, symbols: Vec<String>) -> Self {
        self.snapshots = Some(source);
        self.symbols = symbols;
        self
    }

    pub fn with_errors(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn store(&self) -> &Arc<OrderBookStore> {
        &self.store
    }

    /// Apply the frame if it is book data, otherwise pass it through.
    ///
    /// Returns the number of events applied.
    pub fn route(&self, raw: &str) -> usize {
        let Some(events) = self.decoder.decode(raw) else {
            self.passthrough.on_message(raw);
            return 0;
        };
        events
            .into_iter()
            .filter(|event| self.apply_or_hold(event))
            .count()
    }

    /// Fetch and apply a fresh snapshot for every tracked symbol
    pub async fn resync(&self) -> usize {
        let Some(source) = &self.snapshots else {
            return 0;
        };
        self.hold_tracked();
        seed(
            self.feed,
            source.as_ref(),
            &self.store,
            &self.symbols,
            &self.pending,
            self.errors.as_ref(),
        )
        .await
    }

    /// Number of deltas waiting on `symbol`'s snapshot
    pub fn held(&self, symbol: &str) -> usize {
        self.pending
            .lock()
            .get(&book_key(symbol))
            .map_or(0, VecDeque::len)
    }

    /// Start holding deltas for every tracked symbol; earlier holds are discarded
    fn hold_tracked(&self) {
        let mut pending = self.pending.lock();
        for symbol in &self.symbols {
            pending.insert(book_key(symbol), VecDeque::new());
        }
    }

    fn apply_or_hold(&self, event: &BookEvent) -> bool {
        if let BookEvent::Delta(update) = event {
            let mut pending = self.pending.lock();
            if let Some(held) = pending.get_mut(&book_key(&update.symbol)) {
                if held.len() >= MAX_PENDING_DELTAS {
                    held.pop_front();
                    warn!(symbol = %update.symbol, "Snapshot pending too long, dropping oldest held delta");
                }
                held.push_back(update.clone());
                BOOK_UPDATES.with_label_values(&[self.feed, "held"]).inc();
                return false;
            }
        }
        apply_event(self.feed, &self.store, event)
    }
}

/// Venue symbols compare case-insensitively (`btcusdt` and `BTCUSDT`)
fn book_key(symbol: &str) -> String {
    symbol.to_uppercase()
}

impl MessageSink for BookRouter {
    fn on_message(&self, raw: &str) {
        self.route(raw);
    }

    fn on_connected(&self, conn_id: &str) {
        let Some(source) = self.snapshots.clone() else {
            return;
        };
        debug!(feed = self.feed, conn_id = %conn_id, "Resyncing books");
        self.hold_tracked();
        let feed = self.feed;
        let store = self.store.clone();
        let symbols = self.symbols.clone();
        let pending = self.pending.clone();
        let errors = self.errors.clone();
        tokio::spawn(async move {
            seed(feed, source.as_ref(), &store, &symbols, &pending, errors.as_ref()).await;
        });
    }
}

fn apply_event(feed: &str, store: &OrderBookStore, event: &BookEvent) -> bool {
    let applied = store.apply(event);
    let kind = if applied { event.kind() } else { "stale" };
    BOOK_UPDATES.with_label_values(&[feed, kind]).inc();
    if !applied {
        trace!(symbol = %event.symbol(), "Dropped delta older than snapshot");
    }
    applied
}

async fn seed(
    feed: &str,
    source: &dyn SnapshotSource,
    store: &OrderBookStore,
    symbols: &[String],
    pending: &Mutex<HashMap<String, VecDeque<BookUpdate>>>,
    errors: &dyn ErrorSink,
) -> usize {
    let mut seeded = 0;
    for symbol in symbols {
        let fetched = source.fetch(symbol).await;

        // Held under the lock so no newer delta can overtake the replay
        let mut waiting = pending.lock();
        let held = waiting.remove(&book_key(symbol)).unwrap_or_default();
        match fetched {
            Ok(update) => {
                info!(
                    symbol = %update.symbol,
                    sequence = update.sequence,
                    bids = update.bids.len(),
                    asks = update.asks.len(),
                    held = held.len(),
                    "Order book seeded"
                );
                let snapshot_sequence = update.sequence;
                apply_event(feed, store, &BookEvent::Snapshot(update));
                for delta in held {
                    // Update ids at or below the snapshot's are already in it
                    if delta.sequence <= snapshot_sequence {
                        BOOK_UPDATES.with_label_values(&[feed, "stale"]).inc();
                        continue;
                    }
                    apply_event(feed, store, &BookEvent::Delta(delta));
                }
                seeded += 1;
            }
            Err(e) => {
                errors.on_error(&FeedError::RestApi(format!("{}: {}", symbol, e)));
                for delta in held {
                    apply_event(feed, store, &BookEvent::Delta(delta));
                }
            }
        }
    }
    seeded
}
