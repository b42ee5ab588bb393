//! Error types.
//!
//! Only usage errors reach callers synchronously. Protocol failures (timeouts,
//! disconnects) are recovered by retry and show up as `"timeout"` replies or
//! `phx_error` events instead.

use crate::channel::ChannelId;

/// Usage errors returned by channel operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("tried to join channel '{topic}' more than once")]
    AlreadyJoined { topic: String },

    #[error("tried to push '{event}' to channel '{topic}' before joining")]
    NotJoined { topic: String, event: String },

    #[error("channel {0} not found")]
    NotFound(ChannelId),
}

impl ChannelError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AlreadyJoined { .. } => "already_joined",
            Self::NotJoined { .. } => "not_joined",
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Reasons an inbound text frame is discarded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame payload is not an object")]
    PayloadNotObject,
}

/// Errors from the async driver and its handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The driver loop has stopped and no longer accepts commands.
    #[error("socket driver is closed")]
    Closed,
}

/// Transport-level failures reported by the WebSocket adapter.
#[cfg(feature = "websocket")]
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed by peer")]
    ClosedByPeer,
}
