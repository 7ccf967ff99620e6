//! Error types for WebSocket operations.

use crate::close::{CloseCause, CloseCode, CloseFrame};
use thiserror::Error;

/// WebSocket error type.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Reading from the transport failed
    #[error("Transport read error: {0}")]
    TransportRead(#[source] std::io::Error),

    /// Writing to the transport failed
    #[error("Transport write error: {0}")]
    TransportWrite(#[source] std::io::Error),

    /// Inbound message exceeded the read limit
    #[error("Message too big: {size} bytes exceeds the limit of {limit}")]
    MessageTooBig {
        /// Size of the offending message, as far as it is known
        size: u64,
        /// Configured read limit
        limit: usize,
    },

    /// Peer violated the framing or handshake rules
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Upgrade handshake was rejected
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Handler panicked
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Server no longer accepts connections
    #[error("Server closed")]
    ServerClosed,

    /// Connection left the open state
    #[error("Connection already closed{}", .0.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    AlreadyClosed(Option<CloseCause>),

    /// A deadline expired
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Close frame could not be built
    #[error("Invalid close frame: {0}")]
    InvalidCloseFrame(String),

    /// Options failed validation
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error outside an established connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// Close code that reports this error to the peer.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::MessageTooBig { .. } => CloseCode::MESSAGE_TOO_BIG,
            Self::Protocol(_) | Self::InvalidCloseFrame(_) | Self::Handshake(_) => {
                CloseCode::PROTOCOL_ERROR
            }
            Self::HandlerPanic(_) => CloseCode::INTERNAL_ERROR,
            Self::ServerClosed => CloseCode::GOING_AWAY,
            _ => CloseCode::ABNORMAL,
        }
    }

    /// Close frame the server sends when failing a connection with this error.
    pub(crate) fn close_frame(&self) -> CloseFrame {
        let reason = match self {
            Self::MessageTooBig { .. } => "message too big",
            Self::Protocol(_) | Self::InvalidCloseFrame(_) | Self::Handshake(_) => "protocol error",
            Self::HandlerPanic(_) => "internal error",
            _ => "",
        };
        CloseFrame::internal(self.close_code(), reason)
    }

    /// Close cause carried by an [`WebSocketError::AlreadyClosed`].
    pub fn close_cause(&self) -> Option<&CloseCause> {
        match self {
            Self::AlreadyClosed(cause) => cause.as_ref(),
            _ => None,
        }
    }
}

/// Result type for WebSocket operations.
pub type WebSocketResult<T> = Result<T, WebSocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        let err = WebSocketError::MessageTooBig {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(err.close_code(), CloseCode::MESSAGE_TOO_BIG);
        assert_eq!(
            WebSocketError::Protocol("bad".into()).close_code(),
            CloseCode::PROTOCOL_ERROR
        );
        assert_eq!(
            WebSocketError::HandlerPanic("oops".into()).close_code(),
            CloseCode::INTERNAL_ERROR
        );
        assert_eq!(
            WebSocketError::InvalidCloseFrame("reason too long".into()).close_code(),
            CloseCode::PROTOCOL_ERROR
        );
        assert_eq!(
            WebSocketError::Timeout("read").close_code(),
            CloseCode::ABNORMAL
        );
    }

    #[test]
    fn test_close_frames() {
        let frame = WebSocketError::MessageTooBig {
            size: 2048,
            limit: 1024,
        }
        .close_frame();
        assert_eq!(frame.code, CloseCode::MESSAGE_TOO_BIG);
        assert_eq!(frame.reason, "message too big");

        let frame = WebSocketError::HandlerPanic("oops".into()).close_frame();
        assert_eq!(frame.code, CloseCode::INTERNAL_ERROR);
        assert_eq!(frame.reason, "internal error");
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn test_already_closed_display() {
        assert_eq!(
            WebSocketError::AlreadyClosed(None).to_string(),
            "Connection already closed"
        );
        let cause = CloseCause::clean(CloseFrame::normal());
        let err = WebSocketError::AlreadyClosed(Some(cause));
        assert_eq!(err.to_string(), "Connection already closed: 1000");
        assert!(err.close_cause().is_some());
    }
}
