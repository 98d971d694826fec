//! Gateway socket transport
//!
//! The shard state machine talks to the socket only through
//! [`GatewayTransport`], and obtains sockets from a [`TransportFactory`]
//! supplied in its configuration. [`WsTransportFactory`] is the
//! tokio-tungstenite implementation used in production.

mod inflate;
mod websocket;

pub use inflate::Inflater;
pub use websocket::{WsTransport, WsTransportFactory};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures (gateway socket and REST HTTP)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection closed")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("http error: {0}")]
    Http(String),
}

/// One message read from the gateway socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Close frame with its code, if the peer sent one
    Close(Option<u16>),
}

/// A connected gateway socket
#[async_trait]
pub trait GatewayTransport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next message; `None` once the stream has ended.
    ///
    /// Must be cancel-safe: the shard polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<TransportMessage, TransportError>>;

    async fn close(&mut self, code: u16) -> Result<(), TransportError>;
}

/// Opens gateway sockets
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn GatewayTransport>, TransportError>;
}
