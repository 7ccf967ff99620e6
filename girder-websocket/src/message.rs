//! WebSocket message types.

use crate::close::{CloseCode, CloseFrame};
use crate::deflate;
use crate::error::{WebSocketError, WebSocketResult};
use crate::frame::{MAX_CONTROL_PAYLOAD, OpCode, encode_frame};
use bytes::Bytes;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tungstenite::protocol::frame::coding::{Data as RawData, OpCode as RawOpCode};

/// Message type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Text message
    Text,
    /// Binary message
    Binary,
    /// Ping message
    Ping,
    /// Pong message
    Pong,
    /// Close message
    Close,
}

impl MessageType {
    /// Whether this is a text or binary message.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// A WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The message type
    pub message_type: MessageType,
    /// The message payload
    pub payload: Bytes,
}

impl Message {
    /// Create a new text message.
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            message_type: MessageType::Text,
            payload: Bytes::from(text.into()),
        }
    }

    /// Create a new binary message.
    pub fn binary<B: Into<Bytes>>(data: B) -> Self {
        Self {
            message_type: MessageType::Binary,
            payload: data.into(),
        }
    }

    /// Create a new ping message.
    pub fn ping<B: Into<Bytes>>(data: B) -> Self {
        Self {
            message_type: MessageType::Ping,
            payload: data.into(),
        }
    }

    /// Create a new pong message.
    pub fn pong<B: Into<Bytes>>(data: B) -> Self {
        Self {
            message_type: MessageType::Pong,
            payload: data.into(),
        }
    }

    /// Create a close message carrying `frame`.
    pub fn close(frame: &CloseFrame) -> Self {
        Self {
            message_type: MessageType::Close,
            payload: frame.encode(),
        }
    }

    /// Create a JSON text message from a serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(value)?;
        Ok(Self::text(json))
    }

    /// Parse the message payload as JSON.
    pub fn parse_json<'a, T: Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Get the message payload as a string.
    pub fn as_text(&self) -> Option<&str> {
        if self.message_type == MessageType::Text {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }

    /// Get the message payload as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Check if this is a text message.
    pub fn is_text(&self) -> bool {
        self.message_type == MessageType::Text
    }

    /// Check if this is a binary message.
    pub fn is_binary(&self) -> bool {
        self.message_type == MessageType::Binary
    }

    /// Check if this is a ping message.
    pub fn is_ping(&self) -> bool {
        self.message_type == MessageType::Ping
    }

    /// Check if this is a pong message.
    pub fn is_pong(&self) -> bool {
        self.message_type == MessageType::Pong
    }

    /// Check if this is a close message.
    pub fn is_close(&self) -> bool {
        self.message_type == MessageType::Close
    }

    /// Reject messages that cannot go through a regular write.
    pub(crate) fn check_writable(message_type: MessageType, len: usize) -> WebSocketResult<()> {
        match message_type {
            MessageType::Close => Err(WebSocketError::InvalidCloseFrame(
                "close frames are sent through shutdown_with".to_string(),
            )),
            MessageType::Ping | MessageType::Pong if len > MAX_CONTROL_PAYLOAD => {
                Err(WebSocketError::Protocol(format!(
                    "control frame payload of {len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Encode as a single outbound frame, compressing data messages when
    /// `compression` is set.
    pub(crate) fn encode(&self, compression: Option<Compression>) -> WebSocketResult<Bytes> {
        match compression {
            Some(level) if self.message_type.is_data() => {
                let compressed = deflate::deflate(&self.payload, level)?;
                Ok(encode_frame(self.message_type.into(), true, &compressed))
            }
            _ => Ok(encode_frame(self.message_type.into(), false, &self.payload)),
        }
    }
}

impl From<tungstenite::Message> for Message {
    fn from(msg: tungstenite::Message) -> Self {
        match msg {
            tungstenite::Message::Text(text) => Self::text(text.to_string()),
            tungstenite::Message::Binary(data) => Self::binary(data),
            tungstenite::Message::Ping(data) => Self::ping(data),
            tungstenite::Message::Pong(data) => Self::pong(data),
            tungstenite::Message::Close(frame) => {
                let frame = frame
                    .map(|f| CloseFrame::internal(CloseCode(f.code.into()), f.reason.as_str()))
                    .unwrap_or_else(|| CloseFrame::internal(CloseCode::NO_STATUS_RECEIVED, ""));
                Self::close(&frame)
            }
            tungstenite::Message::Frame(frame) => {
                let payload = Bytes::copy_from_slice(frame.payload());
                match frame.header().opcode {
                    RawOpCode::Data(RawData::Text) => Self {
                        message_type: MessageType::Text,
                        payload,
                    },
                    _ => Self::binary(payload),
                }
            }
        }
    }
}

impl From<Message> for tungstenite::Message {
    fn from(msg: Message) -> Self {
        match msg.message_type {
            MessageType::Text => tungstenite::Message::Text(
                String::from_utf8_lossy(&msg.payload).into_owned().into(),
            ),
            MessageType::Binary => tungstenite::Message::Binary(msg.payload),
            MessageType::Ping => tungstenite::Message::Ping(msg.payload),
            MessageType::Pong => tungstenite::Message::Pong(msg.payload),
            MessageType::Close => match CloseFrame::decode(&msg.payload) {
                Ok(frame) if frame.code.is_sendable() => {
                    tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
                        code: frame.code.0.into(),
                        reason: frame.reason.into(),
                    }))
                }
                _ => tungstenite::Message::Close(None),
            },
        }
    }
}

/// A message encoded once and written to many connections.
///
/// The uncompressed frame is built up front. Compressed frames are built
/// lazily, once per compression level, and shared by every connection
/// that negotiated permessage-deflate at that level.
#[derive(Clone)]
pub struct PreparedMessage {
    inner: Arc<PreparedInner>,
}

struct PreparedInner {
    message_type: MessageType,
    payload: Bytes,
    plain: Bytes,
    compressed: Mutex<HashMap<u32, Bytes>>,
}

impl PreparedMessage {
    /// Encode `message` for repeated writes.
    ///
    /// Close messages are rejected, as are control payloads over 125 bytes.
    pub fn new(message: Message) -> WebSocketResult<Self> {
        Message::check_writable(message.message_type, message.len())?;
        let plain = message.encode(None)?;
        Ok(Self {
            inner: Arc::new(PreparedInner {
                message_type: message.message_type,
                payload: message.payload,
                plain,
                compressed: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Message type.
    pub fn message_type(&self) -> MessageType {
        self.inner.message_type
    }

    /// Uncompressed payload.
    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    /// Wire frame for a connection with the given compression level.
    pub(crate) fn frame(&self, compression: Option<Compression>) -> WebSocketResult<Bytes> {
        let level = match compression {
            Some(level) if self.inner.message_type.is_data() => level,
            _ => return Ok(self.inner.plain.clone()),
        };

        if let Some(frame) = self.inner.compressed.lock().get(&level.level()) {
            return Ok(frame.clone());
        }

        let compressed = deflate::deflate(&self.inner.payload, level)?;
        let frame = encode_frame(OpCode::from(self.inner.message_type), true, &compressed);
        self.inner
            .compressed
            .lock()
            .entry(level.level())
            .or_insert(frame.clone());
        Ok(frame)
    }
}

impl std::fmt::Debug for PreparedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedMessage")
            .field("message_type", &self.inner.message_type)
            .field("len", &self.inner.payload.len())
            .finish()
    }
}
