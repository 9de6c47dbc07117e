//! Error types for the streaming session and local order book

use std::time::Duration;

use thiserror::Error;

/// Faults raised by a feed session, the order book store, or the wiring around them
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    ConnectFailure(String),

    #[error("Authentication rejected: {0}")]
    AuthFailure(String),

    #[error("Heartbeat failed: {0}")]
    HeartbeatFailure(String),

    #[error("No inbound message for {:?}", .0)]
    StalenessTimeout(Duration),

    #[error("WebSocket read failed: {0}")]
    ReadFailure(String),

    #[error("Session restarted {count} times within {window:?}, stopping")]
    RestartLimitExceeded { count: usize, window: Duration },

    #[error("Session will restart in {:?}", .0)]
    RestartPending(Duration),

    #[error("Order book for {0} is not ready")]
    NotReady(String),

    #[error("Failed to send frame: {0}")]
    SendFailure(String),

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FeedError {
    /// Faults the session recovers from by restarting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FeedError::ConnectFailure(_)
                | FeedError::AuthFailure(_)
                | FeedError::HeartbeatFailure(_)
                | FeedError::StalenessTimeout(_)
                | FeedError::ReadFailure(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::ConnectFailure(_) => "connect",
            FeedError::AuthFailure(_) => "auth",
            FeedError::HeartbeatFailure(_) => "heartbeat",
            FeedError::StalenessTimeout(_) => "staleness",
            FeedError::ReadFailure(_) => "read",
            FeedError::RestartLimitExceeded { .. } => "restart_limit",
            FeedError::RestartPending(_) => "restart_pending",
            FeedError::NotReady(_) => "not_ready",
            FeedError::SendFailure(_) => "send",
            FeedError::Parse(_) => "parse",
            FeedError::RestApi(_) => "rest",
            FeedError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::RestApi(err.to_string())
    }
}

impl From<config::ConfigError> for FeedError {
    fn from(err: config::ConfigError) -> Self {
        FeedError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
