//! Binance USDⓈ-M futures feeds
//!
//! Market data runs over the combined stream endpoint, with REST snapshots
//! seeding each book. The user data stream is keyed by a listen key that is
//! created over REST and renewed on every heartbeat.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Feed, Keepalive, TRADE_HEARTBEAT};
use crate::dispatch::SnapshotSource;
use crate::error::{FeedError, Result};
use crate::parser::{millis_or_now, pair_levels, BookDecoder, BookEvent, BookUpdate, PriceLevel};
use crate::websocket::Connection;

pub const BINANCE_MARKET_WS_URL: &str = "wss://fstream.binance.com/stream";
pub const BINANCE_USER_WS_URL: &str = "wss://fstream.binance.com";

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";
const DEPTH_PATH: &str = "/fapi/v1/depth";
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Public market data over the combined stream endpoint
#[derive(Debug, Clone)]
pub struct BinanceMarketFeed {
    ws_url: String,
}

impl BinanceMarketFeed {
    pub fn new() -> Self {
        Self::with_url(BINANCE_MARKET_WS_URL)
    }

    pub fn with_url(ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
        }
    }

    /// Diff depth stream name for `symbol`, e.g. `btcusdt@depth@100ms`
    pub fn depth_stream(symbol: &str) -> Value {
        Value::String(format!("{}@depth@100ms", symbol.to_lowercase()))
    }
}

impl Default for BinanceMarketFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Feed for BinanceMarketFeed {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn endpoint(&self) -> Result<String> {
        Ok(self.ws_url.clone())
    }

    fn subscribe_frame(&self, descriptor: &Value, conn_id: &str) -> Option<String> {
        Some(json!({"id": conn_id, "method": "SUBSCRIBE", "params": [descriptor]}).to_string())
    }

    fn unsubscribe_frame(&self, descriptor: &Value, conn_id: &str) -> Option<String> {
        Some(json!({"id": conn_id, "method": "UNSUBSCRIBE", "params": [descriptor]}).to_string())
    }

    fn is_control(&self, raw: &str) -> bool {
        // Subscription acks: {"result":null,"id":"..."}
        raw.starts_with(r#"{"result""#)
    }
}

#[derive(Debug, Deserialize)]
struct DepthUpdateMsg {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "u")]
    final_update_id: i64,
    #[serde(rename = "b", default)]
    bids: Vec<Value>,
    #[serde(rename = "a", default)]
    asks: Vec<Value>,
}

/// Decodes `depthUpdate` events, bare or wrapped in a combined stream envelope
#[derive(Debug, Default, Clone, Copy)]
pub struct BinanceDepthDecoder;

impl BookDecoder for BinanceDepthDecoder {
    fn decode(&self, raw: &str) -> Option<Vec<BookEvent>> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let data = match value.get("data") {
            Some(data) if value.get("stream").is_some() => data.clone(),
            _ => value,
        };
        let msg: DepthUpdateMsg = serde_json::from_value(data).ok()?;
        if msg.event_type != "depthUpdate" {
            return None;
        }

        let bids = Value::Array(msg.bids);
        let asks = Value::Array(msg.asks);
        Some(vec![BookEvent::Delta(BookUpdate {
            symbol: msg.symbol,
            sequence: msg.final_update_id,
            bids: pair_levels(Some(&bids)),
            asks: pair_levels(Some(&asks)),
            observed_at: millis_or_now(Some(&json!(msg.event_time))),
        })])
    }
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    #[serde(rename = "E")]
    event_time: Option<i64>,
    bids: Vec<Value>,
    asks: Vec<Value>,
}

/// REST depth snapshots used to seed the local books
#[derive(Debug, Clone)]
pub struct BinanceRestSnapshots {
    client: reqwest::Client,
    endpoint: String,
    limit: u32,
}

impl BinanceRestSnapshots {
    pub fn new(endpoint: &str, limit: u32) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            limit,
        })
    }
}

#[async_trait]
impl SnapshotSource for BinanceRestSnapshots {
    async fn fetch(&self, symbol: &str) -> Result<BookUpdate> {
        let url = format!(
            "{}{}?symbol={}&limit={}",
            self.endpoint,
            DEPTH_PATH,
            symbol.to_uppercase(),
            self.limit
        );
        info!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<DepthResponse>()
            .await?;

        Ok(depth_response_update(symbol, response))
    }
}

fn depth_response_update(symbol: &str, response: DepthResponse) -> BookUpdate {
    let levels = |rows: Vec<Value>| -> Vec<PriceLevel> { pair_levels(Some(&Value::Array(rows))) };
    BookUpdate {
        symbol: symbol.to_uppercase(),
        sequence: response.last_update_id,
        bids: levels(response.bids),
        asks: levels(response.asks),
        observed_at: millis_or_now(response.event_time.map(Value::from).as_ref()),
    }
}

/// Issues and renews the token a private stream is keyed by
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire(&self) -> Result<String>;
    async fn renew(&self, token: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey", default)]
    listen_key: String,
}

/// Listen key management over the futures REST API
#[derive(Debug, Clone)]
pub struct BinanceListenKey {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl BinanceListenKey {
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}{}", self.endpoint, LISTEN_KEY_PATH)
    }
}

#[async_trait]
impl TokenProvider for BinanceListenKey {
    async fn acquire(&self) -> Result<String> {
        let response = self
            .client
            .post(self.url())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json::<ListenKeyResponse>()
            .await?;

        if response.listen_key.is_empty() {
            return Err(FeedError::RestApi("empty listen key".to_string()));
        }
        debug!("Listen key created");
        Ok(response.listen_key)
    }

    async fn renew(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .put(self.url())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json::<ListenKeyResponse>()
            .await?;

        if !response.listen_key.is_empty() && response.listen_key != token {
            warn!("Listen key changed on renewal");
        }
        Ok(())
    }
}

/// Private user data stream keyed by a listen key
pub struct BinanceUserFeed {
    tokens: Arc<dyn TokenProvider>,
    ws_base: String,
    listen_key: Mutex<Option<String>>,
}

impl BinanceUserFeed {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_url(tokens, BINANCE_USER_WS_URL)
    }

    pub fn with_url(tokens: Arc<dyn TokenProvider>, ws_base: &str) -> Self {
        Self {
            tokens,
            ws_base: ws_base.trim_end_matches('/').to_string(),
            listen_key: Mutex::new(None),
        }
    }

    /// Current listen key, if one has been acquired
    pub fn listen_key(&self) -> Option<String> {
        self.listen_key.lock().clone()
    }
}

#[async_trait]
impl Feed for BinanceUserFeed {
    fn name(&self) -> &'static str {
        "binance-user"
    }

    async fn endpoint(&self) -> Result<String> {
        let key = self
            .tokens
            .acquire()
            .await
            .map_err(|e| FeedError::AuthFailure(format!("listen key: {}", e)))?;
        let url = format!("{}/ws/{}", self.ws_base, key);
        *self.listen_key.lock() = Some(key);
        Ok(url)
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn authenticate(&self, conn: &mut Connection, conn_id: &str) -> Result<()> {
        let request = json!({
            "id": conn_id,
            "params": ["userDataStream.start"],
            "method": "REQUEST",
        });
        conn.send_text(request.to_string())
            .await
            .map_err(|e| FeedError::AuthFailure(e.to_string()))?;

        let reply = conn.recv_text().await?;
        let value: Value = serde_json::from_str(&reply)
            .map_err(|e| FeedError::AuthFailure(format!("unreadable reply: {}", e)))?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            return Err(FeedError::AuthFailure(error.to_string()));
        }
        Ok(())
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::RenewToken
    }

    async fn renew_token(&self) -> Result<()> {
        let key = self
            .listen_key()
            .ok_or_else(|| FeedError::HeartbeatFailure("no listen key".to_string()))?;
        self.tokens
            .renew(&key)
            .await
            .map_err(|e| FeedError::HeartbeatFailure(e.to_string()))
    }

    fn heartbeat_interval(&self) -> Duration {
        TRADE_HEARTBEAT
    }

    /// Requests such as `account` or `balance` against the current listen key
    fn subscribe_frame(&self, descriptor: &Value, conn_id: &str) -> Option<String> {
        let name = descriptor.as_str()?;
        let key = self.listen_key()?;
        Some(
            json!({
                "id": conn_id,
                "params": [format!("{}@{}", key, name)],
                "method": "REQUEST",
            })
            .to_string(),
        )
    }

    /// Requests are one-shot; nothing to send
    fn unsubscribe_frame(&self, _descriptor: &Value, _conn_id: &str) -> Option<String> {
        None
    }

    /// An expired listen key ends the stream; a new key needs a new connection
    fn fault(&self, raw: &str) -> Option<FeedError> {
        if raw.contains(r#""e":"listenKeyExpired""#) {
            return Some(FeedError::HeartbeatFailure("listen key expired".to_string()));
        }
        None
    }
}
