//! Market Stream - self-healing exchange sessions and local order books
//!
//! This crate keeps a live, per-symbol local order book for an exchange by
//! consuming snapshot and delta messages over a WebSocket session that
//! restarts itself when the connection goes quiet, fails, or is closed.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod feeds;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod websocket;

pub use config::{Config, Exchange, SessionConfig};
pub use dispatch::{BookRouter, SnapshotSource};
pub use error::{FeedError, Result};
pub use feeds::{Feed, Keepalive};
pub use orderbook::{DepthRecord, DepthSnapshot, OrderBookStore};
pub use parser::{BookDecoder, BookEvent, BookUpdate, PriceLevel};
pub use websocket::{ErrorSink, MessageSink, Session, SessionState};
