//! Configuration for the feed binary and its sessions

use config::{Environment, File};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FeedError, Result};

/// Defaults shared by every feed session
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 30;
pub const DEFAULT_RESTART_LIMIT_NUM: usize = 10;
pub const DEFAULT_RESTART_LIMIT_SECS: u64 = 300;
pub const DEFAULT_STALENESS_SECS: u64 = 100;

/// Venue and channel family served by the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Kraken,
    Okx,
    OkxPrivate,
    Binance,
    BinanceUser,
}

impl FromStr for Exchange {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kraken" => Ok(Exchange::Kraken),
            "okx" | "okex" => Ok(Exchange::Okx),
            "okx-private" | "okx_private" => Ok(Exchange::OkxPrivate),
            "binance" => Ok(Exchange::Binance),
            "binance-user" | "binance_user" => Ok(Exchange::BinanceUser),
            other => Err(FeedError::Config(format!("unknown exchange: {}", other))),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// One of `kraken`, `okx`, `okx-private`, `binance`, `binance-user`
    pub exchange: String,

    /// Symbols to subscribe to, in the venue's own notation
    pub symbols: Vec<String>,

    /// Book depth requested on subscribe
    pub depth: u32,

    /// Bind address of the health/depth HTTP server
    pub http_addr: String,

    /// REST endpoint for Binance futures snapshots and listen keys
    pub binance_rest_endpoint: String,

    /// API key for the Binance user data stream
    pub binance_api_key: Option<String>,

    /// Credentials for the OKX private endpoint
    pub okx_api_key: Option<String>,
    pub okx_api_secret: Option<String>,
    pub okx_passphrase: Option<String>,

    /// Restart settings
    pub restart_delay_secs: u64,
    pub restart_limit_num: usize,
    pub restart_limit_secs: u64,

    /// Staleness window in seconds
    pub staleness_secs: u64,

    /// Overrides the feed's own heartbeat interval when set
    pub heartbeat_secs: Option<u64>,
}

impl Config {
    /// Load configuration from `.env`, an optional `market-stream.toml`, and
    /// `MARKET_STREAM_*` environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from(Some("market-stream"))
    }

    /// Load configuration with an explicit optional config file
    pub fn load_from(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("exchange", "kraken")?
            .set_default("symbols", vec!["BTC/USD"])?
            .set_default("depth", 500i64)?
            .set_default("http_addr", "0.0.0.0:9090")?
            .set_default("binance_rest_endpoint", "https://fapi.binance.com")?
            .set_default("restart_delay_secs", DEFAULT_RESTART_DELAY_SECS as i64)?
            .set_default("restart_limit_num", DEFAULT_RESTART_LIMIT_NUM as i64)?
            .set_default("restart_limit_secs", DEFAULT_RESTART_LIMIT_SECS as i64)?
            .set_default("staleness_secs", DEFAULT_STALENESS_SECS as i64)?;

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix("MARKET_STREAM")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbols"),
            )
            .build()?
            .try_deserialize()?;

        config.exchange()?;
        config.session().validate()?;
        Ok(config)
    }

    pub fn exchange(&self) -> Result<Exchange> {
        self.exchange.parse()
    }

    /// Session timings derived from this configuration
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            restart_delay: Duration::from_secs(self.restart_delay_secs),
            restart_limit_num: self.restart_limit_num,
            restart_limit_window: Duration::from_secs(self.restart_limit_secs),
            staleness_interval: Duration::from_secs(self.staleness_secs),
            heartbeat_interval: self.heartbeat_secs.map(Duration::from_secs),
            ..SessionConfig::default()
        }
    }
}

/// Timings for one streaming session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause between tearing a connection down and reconnecting
    pub restart_delay: Duration,
    /// Restarts allowed within `restart_limit_window` before the session stops
    pub restart_limit_num: usize,
    pub restart_limit_window: Duration,
    /// Maximum silence on the connection before it is considered dead
    pub staleness_interval: Duration,
    /// Keepalive period; `None` uses the feed's default
    pub heartbeat_interval: Option<Duration>,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
}

impl SessionConfig {
    /// Rejects periods the duty timers cannot run on
    pub fn validate(&self) -> Result<()> {
        if self.staleness_interval.is_zero() {
            return Err(FeedError::Config("staleness interval must be non-zero".to_string()));
        }
        if self.heartbeat_interval.is_some_and(|period| period.is_zero()) {
            return Err(FeedError::Config("heartbeat interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(DEFAULT_RESTART_DELAY_SECS),
            restart_limit_num: DEFAULT_RESTART_LIMIT_NUM,
            restart_limit_window: Duration::from_secs(DEFAULT_RESTART_LIMIT_SECS),
            staleness_interval: Duration::from_secs(DEFAULT_STALENESS_SECS),
            heartbeat_interval: None,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
        }
    }
}
