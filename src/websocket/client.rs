//! WebSocket connections
//!
//! A [`Connection`] is a split write half and read half. Sessions open them
//! through a [`Connector`], so the transport can be swapped out.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};

pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type WsSource = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

/// One open duplex connection
pub struct Connection {
    pub sink: WsSink,
    pub source: WsSource,
}

impl Connection {
    pub fn new(sink: WsSink, source: WsSource) -> Self {
        Self { sink, source }
    }

    /// Send a text frame
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::SendFailure(e.to_string()))
    }

    /// Wait for the next text frame, skipping transport control frames
    pub async fn recv_text(&mut self) -> Result<String> {
        loop {
            match Inbound::from(self.source.next().await) {
                Inbound::Text(text) => return Ok(text),
                Inbound::Ping(data) => {
                    let _ = self.sink.send(Message::Pong(data)).await;
                }
                Inbound::Pong | Inbound::Other => continue,
                Inbound::Closed(reason) => return Err(FeedError::ReadFailure(reason)),
            }
        }
    }

    /// Close the write half, ending the session from our side
    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Other,
    /// Read error, close frame, or end of stream
    Closed(String),
}

impl From<Option<std::result::Result<Message, WsError>>> for Inbound {
    fn from(frame: Option<std::result::Result<Message, WsError>>) -> Self {
        match frame {
            Some(Ok(Message::Text(text))) => Inbound::Text(text),
            Some(Ok(Message::Binary(data))) => {
                Inbound::Text(String::from_utf8_lossy(&data).to_string())
            }
            Some(Ok(Message::Ping(data))) => Inbound::Ping(data),
            Some(Ok(Message::Pong(_))) => Inbound::Pong,
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                Inbound::Closed(match frame {
                    Some(frame) => format!("closed by server: {} {}", u16::from(frame.code), frame.reason),
                    None => "closed by server".to_string(),
                })
            }
            Some(Ok(Message::Frame(_))) => Inbound::Other,
            Some(Err(e)) => Inbound::Closed(e.to_string()),
            None => Inbound::Closed("stream ended".to_string()),
        }
    }
}

/// Opens connections to a URL
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection>;
}

/// Connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        info!(url = %url, "Connecting to WebSocket");

        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| FeedError::ConnectFailure(format!("Failed to connect: {}", e)))?;

        info!(status = ?response.status(), "WebSocket connected");
        let (sink, source) = ws_stream.split();
        debug!("WebSocket stream split into sink and source");

        Ok(Connection::new(Box::pin(sink), Box::pin(source)))
    }
}
