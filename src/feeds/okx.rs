//! OKX v5 feeds
//!
//! The public endpoint serves books without a handshake. The private endpoint
//! needs a signed `login` before any channel can be subscribed.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use ring::hmac;
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

use super::{Feed, Keepalive};
use crate::error::{FeedError, Result};
use crate::parser::{i64_from_value, millis_or_now, pair_levels, BookDecoder, BookEvent, BookUpdate};
use crate::websocket::Connection;

pub const OKX_PUBLIC_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
pub const OKX_PRIVATE_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";

/// Request path the login signature is computed over
const LOGIN_PATH: &str = "/users/self/verify";

/// Public OKX market session
#[derive(Debug, Clone)]
pub struct OkxPublicFeed {
    ws_url: String,
}

impl OkxPublicFeed {
    pub fn new() -> Self {
        Self::with_url(OKX_PUBLIC_WS_URL)
    }

    pub fn with_url(ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
        }
    }

    /// Full-depth incremental book for an instrument such as `BTC-USDT`
    pub fn books(inst_id: &str) -> Value {
        json!({"channel": "books", "instId": inst_id})
    }
}

impl Default for OkxPublicFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Feed for OkxPublicFeed {
    fn name(&self) -> &'static str {
        "okx"
    }

    async fn endpoint(&self) -> Result<String> {
        Ok(self.ws_url.clone())
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::Text("ping".to_string())
    }

    fn subscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"op": "subscribe", "args": [descriptor]}).to_string())
    }

    fn unsubscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"op": "unsubscribe", "args": [descriptor]}).to_string())
    }

    fn is_control(&self, raw: &str) -> bool {
        raw == "pong"
    }
}

/// API key, secret and passphrase for the private endpoint
#[derive(Clone)]
pub struct OkxCredentials {
    api_key: String,
    secret: Box<[u8]>,
    passphrase: String,
}

impl fmt::Debug for OkxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OkxCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl OkxCredentials {
    pub fn new(api_key: &str, secret: &str, passphrase: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            secret: secret.as_bytes().into(),
            passphrase: passphrase.to_string(),
        }
    }

    /// Base64 HMAC-SHA256 of `timestamp + "GET" + "/users/self/verify"`
    pub fn sign(&self, timestamp: &str) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.secret);
        let message = format!("{}GET{}", timestamp, LOGIN_PATH);
        STANDARD.encode(hmac::sign(&key, message.as_bytes()).as_ref())
    }

    /// `login` request for `timestamp` (Unix seconds)
    pub fn login(&self, timestamp: &str) -> Value {
        json!({
            "op": "login",
            "args": [{
                "apiKey": self.api_key,
                "passphrase": self.passphrase,
                "timestamp": timestamp,
                "sign": self.sign(timestamp),
            }],
        })
    }
}

/// Private OKX session (account, positions, orders)
#[derive(Debug, Clone)]
pub struct OkxPrivateFeed {
    ws_url: String,
    credentials: OkxCredentials,
}

impl OkxPrivateFeed {
    pub fn new(credentials: OkxCredentials) -> Self {
        Self::with_url(credentials, OKX_PRIVATE_WS_URL)
    }

    pub fn with_url(credentials: OkxCredentials, ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            credentials,
        }
    }

    /// Private channel descriptor; order and position channels cover every instrument type
    pub fn channel(name: &str) -> Value {
        match name {
            "orders" | "positions" => json!({"channel": name, "instType": "ANY"}),
            _ => json!({"channel": name}),
        }
    }
}

/// Accepts `{"event":"login","code":"0"}` and rejects anything else
fn check_login_reply(reply: &str) -> Result<()> {
    let value: Value = serde_json::from_str(reply)
        .map_err(|e| FeedError::AuthFailure(format!("unreadable login reply: {}", e)))?;
    let event = value.get("event").and_then(Value::as_str).unwrap_or_default();
    let code = value.get("code").and_then(Value::as_str).unwrap_or_default();
    if event == "error" || code != "0" {
        let msg = value.get("msg").and_then(Value::as_str).unwrap_or(reply);
        return Err(FeedError::AuthFailure(format!("login error {}: {}", code, msg)));
    }
    Ok(())
}

#[async_trait]
impl Feed for OkxPrivateFeed {
    fn name(&self) -> &'static str {
        "okx-private"
    }

    async fn endpoint(&self) -> Result<String> {
        Ok(self.ws_url.clone())
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn authenticate(&self, conn: &mut Connection, conn_id: &str) -> Result<()> {
        let timestamp = Utc::now().timestamp().to_string();
        conn.send_text(self.credentials.login(&timestamp).to_string())
            .await
            .map_err(|e| FeedError::AuthFailure(e.to_string()))?;

        check_login_reply(&conn.recv_text().await?)?;
        debug!(conn_id = %conn_id, "OKX login accepted");
        Ok(())
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive::Text("ping".to_string())
    }

    fn subscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"op": "subscribe", "args": [descriptor]}).to_string())
    }

    fn unsubscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"op": "unsubscribe", "args": [descriptor]}).to_string())
    }

    fn is_control(&self, raw: &str) -> bool {
        raw == "pong"
    }
}

/// Decodes `books*` channel pushes; `seqId` is the sequence when present
#[derive(Debug, Default, Clone, Copy)]
pub struct OkxBookDecoder;

impl BookDecoder for OkxBookDecoder {
    fn decode(&self, raw: &str) -> Option<Vec<BookEvent>> {
        let msg: Value = serde_json::from_str(raw).ok()?;
        let arg = msg.get("arg")?;
        if !arg.get("channel")?.as_str()?.starts_with("books") {
            return None;
        }
        let symbol = arg.get("instId")?.as_str()?;
        // books5 and bbo-tbt push full books without an action
        let is_snapshot = match msg.get("action").and_then(Value::as_str) {
            Some("update") => false,
            Some("snapshot") | None => true,
            Some(_) => return None,
        };

        let events = msg
            .get("data")?
            .as_array()?
            .iter()
            .map(|entry| {
                let update = BookUpdate {
                    symbol: symbol.to_string(),
                    sequence: entry
                        .get("seqId")
                        .or_else(|| entry.get("checksum"))
                        .and_then(i64_from_value)
                        .unwrap_or(0),
                    bids: pair_levels(entry.get("bids")),
                    asks: pair_levels(entry.get("asks")),
                    observed_at: millis_or_now(entry.get("ts")),
                };
                if is_snapshot {
                    BookEvent::Snapshot(update)
                } else {
                    BookEvent::Delta(update)
                }
            })
            .collect();
        Some(events)
    }
}
