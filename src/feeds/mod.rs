//! Venue specializations
//!
//! A [`Feed`] supplies everything protocol specific about a session: where to
//! connect, how to authenticate, how to keep the connection alive, and how a
//! subscription descriptor is framed on the wire.

mod binance;
mod kraken;
mod okx;

pub use binance::{
    BinanceDepthDecoder, BinanceListenKey, BinanceMarketFeed, BinanceRestSnapshots,
    BinanceUserFeed, TokenProvider,
};
pub use kraken::{KrakenBookDecoder, KrakenSpotFeed};
pub use okx::{OkxBookDecoder, OkxCredentials, OkxPrivateFeed, OkxPublicFeed};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::{FeedError, Result};
use crate::websocket::Connection;

/// Heartbeat period for public market feeds
pub const MARKET_HEARTBEAT: Duration = Duration::from_secs(15);
/// Heartbeat period for private trade feeds backed by a session token
pub const TRADE_HEARTBEAT: Duration = Duration::from_secs(60);

/// How a feed keeps its connection alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keepalive {
    /// Transport-level ping frame
    Ping,
    /// Application-level text frame
    Text(String),
    /// Renew the session token over REST
    RenewToken,
}

#[async_trait]
pub trait Feed: Send + Sync {
    fn name(&self) -> &'static str;

    /// URL for a fresh connection. Token-backed feeds acquire their token here.
    async fn endpoint(&self) -> Result<String>;

    fn requires_auth(&self) -> bool {
        false
    }

    /// Handshake run on a new connection before it is considered active
    async fn authenticate(&self, _conn: &mut Connection, _conn_id: &str) -> Result<()> {
        Ok(())
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::Ping
    }

    /// Renew the session token; only called for [`Keepalive::RenewToken`]
    async fn renew_token(&self) -> Result<()> {
        Ok(())
    }

    fn heartbeat_interval(&self) -> Duration {
        MARKET_HEARTBEAT
    }

    /// Wire frame subscribing to `descriptor`
    fn subscribe_frame(&self, descriptor: &Value, conn_id: &str) -> Option<String>;

    /// Wire frame unsubscribing from `descriptor`, if the venue supports it
    fn unsubscribe_frame(&self, descriptor: &Value, conn_id: &str) -> Option<String>;

    /// Feed-level control frames that are consumed rather than delivered
    fn is_control(&self, _raw: &str) -> bool {
        false
    }

    /// Frames announcing the connection can no longer be used. The receive
    /// duty reports the returned error and restarts the session.
    fn fault(&self, _raw: &str) -> Option<FeedError> {
        None
    }
}
