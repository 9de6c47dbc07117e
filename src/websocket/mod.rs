//! WebSocket transport and the self-healing session built on it

mod client;
mod handler;
mod session;

pub use client::{Connection, Connector, Inbound, TungsteniteConnector, WsSink, WsSource};
pub use handler::{ErrorSink, LogErrorSink, LogMessageSink, MessageSink};
pub use session::{Session, SessionState};
