//! Close frames and close causes.

use crate::error::{WebSocketError, WebSocketResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Maximum length of a close reason in bytes.
pub const MAX_CLOSE_REASON_LEN: usize = 123;

/// WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// 1000: normal closure.
    pub const NORMAL: Self = Self(1000);
    /// 1001: endpoint going away.
    pub const GOING_AWAY: Self = Self(1001);
    /// 1002: protocol error.
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// 1003: unsupported data.
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    /// 1005: no status code was present. Never sent on the wire.
    pub const NO_STATUS_RECEIVED: Self = Self(1005);
    /// 1006: connection dropped without a close frame. Never sent on the wire.
    pub const ABNORMAL: Self = Self(1006);
    /// 1007: invalid frame payload data.
    pub const INVALID_PAYLOAD: Self = Self(1007);
    /// 1008: policy violation.
    pub const POLICY_VIOLATION: Self = Self(1008);
    /// 1009: message too big.
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    /// 1010: mandatory extension missing.
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    /// 1011: internal server error.
    pub const INTERNAL_ERROR: Self = Self(1011);
    /// 1012: service restart.
    pub const SERVICE_RESTART: Self = Self(1012);
    /// 1013: try again later.
    pub const TRY_AGAIN_LATER: Self = Self(1013);
    /// 1014: bad gateway.
    pub const BAD_GATEWAY: Self = Self(1014);
    /// 1015: TLS handshake failure. Never sent on the wire.
    pub const TLS_HANDSHAKE: Self = Self(1015);

    /// Whether the code may appear in a close frame on the wire.
    pub fn is_sendable(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A close frame: status code plus reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code
    pub code: CloseCode,
    /// Human-readable reason, at most 123 bytes
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame, checking the reason length.
    pub fn new(code: impl Into<CloseCode>, reason: impl Into<String>) -> WebSocketResult<Self> {
        let frame = Self {
            code: code.into(),
            reason: reason.into(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// 1000 with an empty reason.
    pub fn normal() -> Self {
        Self {
            code: CloseCode::NORMAL,
            reason: String::new(),
        }
    }

    /// 1001 "server shutting down", the default for server shutdown.
    pub fn going_away() -> Self {
        Self {
            code: CloseCode::GOING_AWAY,
            reason: "server shutting down".to_string(),
        }
    }

    pub(crate) fn internal(code: CloseCode, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    /// Check the reason length.
    pub fn validate(&self) -> WebSocketResult<()> {
        if self.reason.len() > MAX_CLOSE_REASON_LEN {
            return Err(WebSocketError::InvalidCloseFrame(format!(
                "reason is {} bytes, at most {} allowed",
                self.reason.len(),
                MAX_CLOSE_REASON_LEN
            )));
        }
        Ok(())
    }

    /// Wire payload: big-endian code followed by the reason.
    ///
    /// Codes that may not be sent produce an empty payload.
    pub fn encode(&self) -> Bytes {
        if !self.code.is_sendable() {
            return Bytes::new();
        }
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code.0);
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }

    /// Parse a close frame payload received from a peer.
    ///
    /// An empty payload stands for [`CloseCode::NO_STATUS_RECEIVED`].
    pub fn decode(payload: &[u8]) -> WebSocketResult<Self> {
        match payload {
            [] => Ok(Self {
                code: CloseCode::NO_STATUS_RECEIVED,
                reason: String::new(),
            }),
            [_] => Err(WebSocketError::Protocol(
                "close frame payload of one byte".to_string(),
            )),
            [hi, lo, reason @ ..] => {
                let code = CloseCode(u16::from_be_bytes([*hi, *lo]));
                if !code.is_sendable() {
                    return Err(WebSocketError::Protocol(format!(
                        "invalid close code {code}"
                    )));
                }
                let reason = std::str::from_utf8(reason).map_err(|_| {
                    WebSocketError::Protocol("close reason is not valid UTF-8".to_string())
                })?;
                Ok(Self {
                    code,
                    reason: reason.to_string(),
                })
            }
        }
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Why a connection left the open state.
#[derive(Debug, Clone)]
pub struct CloseCause {
    /// The close frame sent or received
    pub frame: CloseFrame,
    /// Whether a proper close handshake concluded
    pub was_clean: bool,
    /// Underlying error, if any
    pub error: Option<Arc<WebSocketError>>,
}

impl CloseCause {
    pub(crate) fn clean(frame: CloseFrame) -> Self {
        Self {
            frame,
            was_clean: true,
            error: None,
        }
    }

    pub(crate) fn unclean(frame: CloseFrame, error: Option<WebSocketError>) -> Self {
        Self {
            frame,
            was_clean: false,
            error: error.map(Arc::new),
        }
    }

    pub(crate) fn abnormal(error: Option<WebSocketError>) -> Self {
        Self::unclean(
            CloseFrame::internal(CloseCode::ABNORMAL, "abnormal closure"),
            error,
        )
    }

    /// Status code of the close frame.
    pub fn code(&self) -> CloseCode {
        self.frame.code
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.frame)?;
        if !self.was_clean {
            f.write_str(", unclean")?;
        }
        if let Some(error) = &self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}
