//! Callback capabilities handed to a session
//!
//! Both are invoked from background tasks owned by the session (the receipt,
//! heartbeat and staleness duties and the restart supervisor). Implementations
//! must return promptly; a blocking sink stalls the duty that called it.

use tracing::{error, trace, warn};

use crate::error::FeedError;

/// Receives every fault a session detects
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, error: &FeedError);
}

/// Receives inbound text frames
pub trait MessageSink: Send + Sync {
    fn on_message(&self, raw: &str);

    /// Called once a (re)connect has completed and subscriptions were replayed
    fn on_connected(&self, _conn_id: &str) {}
}

impl<F> ErrorSink for F
where
    F: Fn(&FeedError) + Send + Sync,
{
    fn on_error(&self, error: &FeedError) {
        self(error)
    }
}

/// Default error sink: logs the fault
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn on_error(&self, err: &FeedError) {
        match err {
            FeedError::RestartLimitExceeded { .. } => error!(error = %err, "Session stopped"),
            FeedError::RestartPending(_) => warn!(error = %err, "Session restarting"),
            _ => warn!(error = %err, kind = err.kind(), "Session fault"),
        }
    }
}

/// Default message sink: traces the frame and drops it
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageSink;

impl MessageSink for LogMessageSink {
    fn on_message(&self, raw: &str) {
        trace!(msg = %raw, "Unrouted message");
    }
}
