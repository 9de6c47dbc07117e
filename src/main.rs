//! Market Stream - exchange session runner
//!
//! Connects to the configured venue, keeps local order books for the
//! configured symbols, and serves health, depth and metrics over HTTP.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_stream::feeds::{
    BinanceDepthDecoder, BinanceListenKey, BinanceMarketFeed, BinanceRestSnapshots,
    BinanceUserFeed, KrakenBookDecoder, KrakenSpotFeed, OkxBookDecoder, OkxCredentials,
    OkxPrivateFeed, OkxPublicFeed,
};
use market_stream::websocket::{LogErrorSink, LogMessageSink};
use market_stream::{
    metrics, BookRouter, Config, Exchange, Feed, FeedError, MessageSink, OrderBookStore, Session,
};

/// Binance caps REST depth snapshots at 1000 levels
const BINANCE_SNAPSHOT_LIMIT: u32 = 1000;
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state for the HTTP handlers
#[derive(Clone)]
struct AppState {
    store: Arc<OrderBookStore>,
    session: Session,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Stream");

    let config = Config::load()?;
    let exchange = config.exchange()?;
    info!(exchange = ?exchange, symbols = ?config.symbols, "Configuration loaded");

    let store = Arc::new(OrderBookStore::new());
    let (feed, messages, descriptors) = build_feed(&config, exchange, store.clone())?;

    let session = Session::new(
        feed,
        config.session(),
        Arc::new(LogErrorSink),
        messages,
    );

    for descriptor in descriptors {
        session.subscribe(descriptor).await;
    }

    if let Err(e) = session.start().await {
        warn!(error = %e, "Initial connect failed, restarting");
        let restarting = session.clone();
        tokio::spawn(async move {
            if let Err(e) = restarting.restart().await {
                warn!(error = %e, "Session gave up");
            }
        });
    }

    let state = AppState {
        store: store.clone(),
        session: session.clone(),
    };
    let http_addr = config.http_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = start_http_server(&http_addr, state).await {
            warn!(error = %e, "HTTP server error");
        }
    });

    tokio::spawn(log_status(store, session.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.stop().await;

    Ok(())
}

type FeedParts = (Arc<dyn Feed>, Arc<dyn MessageSink>, Vec<Value>);

/// Feed, message sink and subscription descriptors for the configured venue
fn build_feed(config: &Config, exchange: Exchange, store: Arc<OrderBookStore>) -> anyhow::Result<FeedParts> {
    let passthrough: Arc<dyn MessageSink> = Arc::new(LogMessageSink);

    let parts: FeedParts = match exchange {
        Exchange::Kraken => {
            let feed = KrakenSpotFeed::new();
            let router = BookRouter::new(feed.name(), KrakenBookDecoder, store, passthrough);
            let descriptors = config
                .symbols
                .iter()
                .map(|symbol| KrakenSpotFeed::book(symbol, config.depth))
                .collect();
            (Arc::new(feed), Arc::new(router), descriptors)
        }
        Exchange::Okx => {
            let feed = OkxPublicFeed::new();
            let router = BookRouter::new(feed.name(), OkxBookDecoder, store, passthrough);
            let descriptors = config
                .symbols
                .iter()
                .map(|symbol| OkxPublicFeed::books(symbol))
                .collect();
            (Arc::new(feed), Arc::new(router), descriptors)
        }
        Exchange::OkxPrivate => {
            let required = |value: &Option<String>, name: &str| {
                value.clone().ok_or_else(|| {
                    FeedError::Config(format!("{} is required for okx-private", name))
                })
            };
            let credentials = OkxCredentials::new(
                &required(&config.okx_api_key, "okx_api_key")?,
                &required(&config.okx_api_secret, "okx_api_secret")?,
                &required(&config.okx_passphrase, "okx_passphrase")?,
            );
            let feed = OkxPrivateFeed::new(credentials);
            // Symbols name the private channels, e.g. `account` or `orders`
            let descriptors = config
                .symbols
                .iter()
                .map(|name| OkxPrivateFeed::channel(name))
                .collect();
            (Arc::new(feed), passthrough, descriptors)
        }
        Exchange::Binance => {
            let feed = BinanceMarketFeed::new();
            let snapshots = BinanceRestSnapshots::new(
                &config.binance_rest_endpoint,
                config.depth.min(BINANCE_SNAPSHOT_LIMIT),
            )?;
            let symbols = config.symbols.iter().map(|s| s.to_uppercase()).collect();
            let router = BookRouter::new(feed.name(), BinanceDepthDecoder, store, passthrough)
                .with_snapshots(Arc::new(snapshots), symbols);
            let descriptors = config
                .symbols
                .iter()
                .map(|symbol| BinanceMarketFeed::depth_stream(symbol))
                .collect();
            (Arc::new(feed), Arc::new(router), descriptors)
        }
        Exchange::BinanceUser => {
            let api_key = config.binance_api_key.as_deref().ok_or_else(|| {
                FeedError::Config("binance_api_key is required for binance-user".to_string())
            })?;
            let tokens = BinanceListenKey::new(&config.binance_rest_endpoint, api_key)?;
            let feed = BinanceUserFeed::new(Arc::new(tokens));
            // Symbols name the user data requests, e.g. `account` or `balance`
            let descriptors = config
                .symbols
                .iter()
                .map(|name| Value::String(name.clone()))
                .collect();
            (Arc::new(feed), passthrough, descriptors)
        }
    };
    Ok(parts)
}

/// Periodically log session state and top of book
async fn log_status(store: Arc<OrderBookStore>, session: Session) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        ticker.tick().await;
        info!(
            feed = session.feed_name(),
            state = %session.state(),
            conn_id = ?session.conn_id(),
            restarts = session.restart_count(),
            "Session status"
        );
        for symbol in store.symbols() {
            if let Ok(depth) = store.snapshot(&symbol) {
                info!(
                    symbol = %symbol,
                    sequence = depth.sequence,
                    mid_price = ?depth.mid_price(),
                    spread = ?depth.spread(),
                    bid_levels = depth.bids.len(),
                    ask_levels = depth.asks.len(),
                    "Order book status"
                );
            }
        }
    }
}

/// Start HTTP server for health checks, depth queries and metrics
async fn start_http_server(addr: &str, state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/depth/:symbol", get(depth))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "component": "market-stream",
        "feed": state.session.feed_name(),
        "session": state.session.state().to_string(),
        "conn_id": state.session.conn_id(),
        "restarts": state.session.restart_count(),
        "symbols": state.store.symbols(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn depth(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    match state.store.snapshot(&symbol) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e @ FeedError::NotReady(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn metrics_text() -> String {
    metrics::render()
}
