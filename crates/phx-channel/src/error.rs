//! Error types for channel operations.

use std::fmt;
use thiserror::Error;

/// Why a channel (or the socket underneath it) stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The channel was left explicitly.
    Left,
    /// The socket was disconnected explicitly.
    Disconnected,
    /// The server closed the WebSocket (close frame or end of stream).
    TransportClosed,
    /// Reading or writing the WebSocket failed.
    TransportError(String),
    /// A heartbeat went unanswered for a full interval.
    HeartbeatTimeout,
    /// The server sent `phx_close` for the topic.
    ServerClosed,
    /// The server sent `phx_error` for the topic.
    ServerError,
    /// The server declined the join.
    Rejected(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Left => write!(f, "left"),
            CloseReason::Disconnected => write!(f, "disconnected"),
            CloseReason::TransportClosed => write!(f, "transport closed"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::ServerClosed => write!(f, "closed by server"),
            CloseReason::ServerError => write!(f, "channel errored on server"),
            CloseReason::Rejected(reason) => write!(f, "join rejected: {}", reason),
        }
    }
}

/// Cancellation signal delivered to reply handlers still pending when a
/// channel closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("channel closed: {reason}")]
pub struct ChannelClosed {
    /// What closed the channel.
    pub reason: CloseReason,
}

impl ChannelClosed {
    /// Create a closure signal with the given reason.
    pub fn new(reason: CloseReason) -> Self {
        Self { reason }
    }
}

/// Errors that can occur when using a channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Connecting to, reading from or writing to the socket failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The socket address could not be turned into a WebSocket URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// An inbound frame was malformed.
    #[error("decode error: {0}")]
    Decode(String),

    /// An outbound payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// The server declined the join.
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// A message ref was registered twice. Indicates a bug in ref allocation.
    #[error("duplicate message ref: {0}")]
    DuplicateRef(String),

    /// The channel is closed.
    #[error(transparent)]
    Closed(#[from] ChannelClosed),

    /// The operation needs a joined channel.
    #[error("channel {topic} is not joined (state: {state})")]
    NotJoined {
        /// Topic of the channel.
        topic: String,
        /// State the channel was in.
        state: crate::channel::ChannelState,
    },

    /// Topic or event name is empty.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A live channel for the topic already exists on this socket.
    #[error("topic already joined on this socket: {0}")]
    AlreadyJoined(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChannelError::Connection(e.to_string())
    }
}

impl From<url::ParseError> for ChannelError {
    fn from(e: url::ParseError) -> Self {
        ChannelError::InvalidUrl(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_display() {
        let err = ChannelError::from(ChannelClosed::new(CloseReason::Left));
        assert_eq!(err.to_string(), "channel closed: left");
    }

    #[test]
    fn test_websocket_error_is_connection_error() {
        let err = ChannelError::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, ChannelError::Connection(_)));
    }
}
