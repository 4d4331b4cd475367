pub mod registry;
pub mod transport;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid channel url: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed unexpectedly")]
    Closed,
}

/// Frames sent by the client. The server keeps no subscription state across
/// disconnects, so `Subscribe` frames are re-sent on every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

/// Frames received from the server. Anything that fails to parse into one of
/// these is logged and dropped at the transport boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Update {
        channel: String,
        data: serde_json::Value,
    },
    Pong,
}

/// Lifecycle and frame events emitted by the transport, consumed by the
/// registry's dispatch task.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket reached OPEN. Subscriptions must be (re-)sent now.
    Open,
    /// The socket closed, whether from network failure or a server close.
    Closed,
    /// All reconnect attempts were used up; the transport stays closed until
    /// a fresh `connect()`.
    Exhausted,
    Frame(ServerFrame),
}

/// The seam between the registry and the physical connection. Production code
/// uses [`transport::ChannelTransport`]; tests use a recording fake.
pub trait Transport: Send + Sync {
    /// Idempotent: establishes the connection if not already running.
    fn connect(&self);
    fn send_frame(&self, frame: ClientFrame);
}
