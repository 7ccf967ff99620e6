//! RFC 6455 frame codec, server side.
//!
//! Inbound frames come from a client, so they must be masked. Outbound
//! frames are never masked and never fragmented. Message assembly, the
//! read limit and permessage-deflate decompression live in
//! [`FrameReader`]; [`FrameWriter`] owns the write half.

use crate::close::CloseFrame;
use crate::deflate::Inflater;
use crate::error::{WebSocketError, WebSocketResult};
use crate::message::{Message, MessageType};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a control frame may carry.
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl From<MessageType> for OpCode {
    fn from(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Text => Self::Text,
            MessageType::Binary => Self::Binary,
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
            MessageType::Close => Self::Close,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Read a header from the wire.
    pub async fn read<R: AsyncRead + Unpin>(io: &mut R) -> WebSocketResult<Self> {
        let mut head = [0u8; 2];
        io.read_exact(&mut head)
            .await
            .map_err(WebSocketError::TransportRead)?;

        let opcode = OpCode::from_u8(head[0] & 0x0F).ok_or_else(|| {
            WebSocketError::Protocol(format!("reserved opcode {:#x}", head[0] & 0x0F))
        })?;

        let payload_len = match head[1] & 0x7F {
            126 => u64::from(io.read_u16().await.map_err(WebSocketError::TransportRead)?),
            127 => {
                let len = io.read_u64().await.map_err(WebSocketError::TransportRead)?;
                if len & (1 << 63) != 0 {
                    return Err(WebSocketError::Protocol(
                        "payload length has the most significant bit set".to_string(),
                    ));
                }
                len
            }
            len => u64::from(len),
        };

        let mask = if head[1] & 0x80 != 0 {
            let mut key = [0u8; 4];
            io.read_exact(&mut key)
                .await
                .map_err(WebSocketError::TransportRead)?;
            Some(key)
        } else {
            None
        };

        Ok(Self {
            fin: head[0] & 0x80 != 0,
            rsv1: head[0] & 0x40 != 0,
            rsv2: head[0] & 0x20 != 0,
            rsv3: head[0] & 0x10 != 0,
            opcode,
            mask,
            payload_len,
        })
    }
}

/// XOR `data` with the masking key.
pub(crate) fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Encode a single final, unmasked frame.
pub(crate) fn encode_frame(opcode: OpCode, rsv1: bool, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 10);

    let mut b0 = 0x80 | opcode as u8;
    if rsv1 {
        b0 |= 0x40;
    }
    buf.put_u8(b0);

    match payload.len() {
        len if len < 126 => buf.put_u8(len as u8),
        len if len <= usize::from(u16::MAX) => {
            buf.put_u8(126);
            buf.put_u16(len as u16);
        }
        len => {
            buf.put_u8(127);
            buf.put_u64(len as u64);
        }
    }

    buf.put_slice(payload);
    buf.freeze()
}

/// One unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// A complete text or binary message
    Data(Message),
    Ping(Bytes),
    Pong(Bytes),
    Close(CloseFrame),
}

struct Partial {
    message_type: MessageType,
    compressed: bool,
    buf: BytesMut,
}

/// Reads frames and assembles messages from the read half.
pub(crate) struct FrameReader<R> {
    io: R,
    limit: usize,
    inflater: Option<Inflater>,
    partial: Option<Partial>,
    pending_skip: u64,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `limit` caps every assembled message; `inflate` enables RSV1 frames.
    pub fn new(io: R, limit: usize, inflate: bool) -> Self {
        Self {
            io,
            limit,
            inflater: inflate.then(Inflater::new),
            partial: None,
            pending_skip: 0,
            discarding: false,
        }
    }

    /// Read one frame.
    ///
    /// Returns `None` when the frame was a non-final fragment, or data
    /// that is being discarded after an oversize message.
    pub async fn read_frame(&mut self) -> WebSocketResult<Option<Inbound>> {
        if self.pending_skip > 0 {
            let skip = std::mem::take(&mut self.pending_skip);
            self.skip(skip).await?;
        }

        let header = FrameHeader::read(&mut self.io).await?;

        if header.rsv2 || header.rsv3 {
            return Err(WebSocketError::Protocol("reserved bits set".to_string()));
        }
        let Some(key) = header.mask else {
            return Err(WebSocketError::Protocol(
                "client frame is not masked".to_string(),
            ));
        };

        if header.opcode.is_control() {
            return self.read_control(&header, key).await.map(Some);
        }

        if self.discarding {
            return self.discard(&header).await;
        }

        let buffered = self.start_or_continue(&header)?;
        let total = buffered as u64 + header.payload_len;
        if total > self.limit as u64 {
            self.partial = None;
            self.discarding = !header.fin;
            self.pending_skip = header.payload_len;
            return Err(WebSocketError::MessageTooBig {
                size: total,
                limit: self.limit,
            });
        }

        let Some(partial) = self.partial.as_mut() else {
            return Ok(None);
        };
        // `total` fits in `limit`, so the length fits in usize.
        let len = header.payload_len as usize;
        let start = partial.buf.len();
        partial.buf.resize(start + len, 0);
        self.io
            .read_exact(&mut partial.buf[start..])
            .await
            .map_err(WebSocketError::TransportRead)?;
        apply_mask(&mut partial.buf[start..], key);

        if !header.fin {
            return Ok(None);
        }

        let Some(partial) = self.partial.take() else {
            return Ok(None);
        };
        let payload = match (&mut self.inflater, partial.compressed) {
            (Some(inflater), true) => inflater.inflate(&partial.buf, self.limit)?,
            _ => partial.buf.freeze(),
        };

        Ok(Some(Inbound::Data(Message {
            message_type: partial.message_type,
            payload,
        })))
    }

    /// Validate a data frame against the fragmentation state and return
    /// the number of bytes already buffered for the message.
    fn start_or_continue(&mut self, header: &FrameHeader) -> WebSocketResult<usize> {
        match header.opcode {
            OpCode::Continuation => {
                if header.rsv1 {
                    return Err(WebSocketError::Protocol(
                        "RSV1 set on a continuation frame".to_string(),
                    ));
                }
                self.partial
                    .as_ref()
                    .map(|partial| partial.buf.len())
                    .ok_or_else(|| {
                        WebSocketError::Protocol("continuation frame without a message".to_string())
                    })
            }
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(WebSocketError::Protocol(
                        "data frame interleaved with a fragmented message".to_string(),
                    ));
                }
                if header.rsv1 && self.inflater.is_none() {
                    return Err(WebSocketError::Protocol(
                        "compressed frame without negotiated compression".to_string(),
                    ));
                }
                let message_type = if header.opcode == OpCode::Text {
                    MessageType::Text
                } else {
                    MessageType::Binary
                };
                self.partial = Some(Partial {
                    message_type,
                    compressed: header.rsv1,
                    buf: BytesMut::new(),
                });
                Ok(0)
            }
            _ => Err(WebSocketError::Protocol(format!(
                "unexpected opcode {:?}",
                header.opcode
            ))),
        }
    }

    async fn read_control(
        &mut self,
        header: &FrameHeader,
        key: [u8; 4],
    ) -> WebSocketResult<Inbound> {
        if !header.fin {
            return Err(WebSocketError::Protocol(
                "fragmented control frame".to_string(),
            ));
        }
        if header.rsv1 {
            return Err(WebSocketError::Protocol(
                "RSV1 set on a control frame".to_string(),
            ));
        }
        if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WebSocketError::Protocol(format!(
                "control frame payload of {} bytes",
                header.payload_len
            )));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.io
            .read_exact(&mut payload)
            .await
            .map_err(WebSocketError::TransportRead)?;
        apply_mask(&mut payload, key);

        Ok(match header.opcode {
            OpCode::Ping => Inbound::Ping(Bytes::from(payload)),
            OpCode::Pong => Inbound::Pong(Bytes::from(payload)),
            _ => Inbound::Close(CloseFrame::decode(&payload)?),
        })
    }

    /// Drop the rest of an oversize message.
    async fn discard(&mut self, header: &FrameHeader) -> WebSocketResult<Option<Inbound>> {
        self.skip(header.payload_len).await?;
        match header.opcode {
            OpCode::Continuation if header.fin => self.discarding = false,
            OpCode::Continuation => {}
            // A new message starts: the oversize one ended without a final frame.
            _ => {
                self.discarding = false;
                return Err(WebSocketError::Protocol(
                    "data frame interleaved with a fragmented message".to_string(),
                ));
            }
        }
        Ok(None)
    }

    async fn skip(&mut self, len: u64) -> WebSocketResult<()> {
        let copied = tokio::io::copy(&mut (&mut self.io).take(len), &mut tokio::io::sink())
            .await
            .map_err(WebSocketError::TransportRead)?;
        if copied < len {
            return Err(WebSocketError::TransportRead(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        Ok(())
    }
}

/// Owns the write half and serialises whole frames onto it.
pub(crate) struct FrameWriter<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io }
    }

    /// Write a pre-encoded frame and flush.
    pub async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.io.write_all(frame).await?;
        self.io.flush().await
    }

    /// Flush and shut the write direction down.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;
    use crate::deflate;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn client_frame(b0: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![b0];
        match payload.len() {
            len if len < 126 => out.push(0x80 | len as u8),
            len if len <= 0xFFFF => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&KEY);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, KEY);
        out.extend_from_slice(&masked);
        out
    }

    fn reader(bytes: Vec<u8>, limit: usize) -> FrameReader<std::io::Cursor<Vec<u8>>> {
        FrameReader::new(std::io::Cursor::new(bytes), limit, false)
    }

    #[test]
    fn test_encode_small_frame() {
        let frame = encode_frame(OpCode::Text, false, b"Hello");
        assert_eq!(frame.as_ref(), &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_extended_lengths() {
        let medium = encode_frame(OpCode::Binary, false, &[0u8; 300]);
        assert_eq!(&medium[..4], &[0x82, 126, 0x01, 0x2C]);
        assert_eq!(medium.len(), 4 + 300);

        let large = encode_frame(OpCode::Binary, true, &vec![0u8; 70_000]);
        assert_eq!(large[0], 0xC2);
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn test_mask_is_involution() {
        let mut data = b"masking twice restores".to_vec();
        apply_mask(&mut data, KEY);
        assert_ne!(&data, b"masking twice restores");
        apply_mask(&mut data, KEY);
        assert_eq!(&data, b"masking twice restores");
    }

    #[tokio::test]
    async fn test_read_masked_text() {
        let mut reader = reader(client_frame(0x81, b"Hello"), 1024);
        let inbound = reader.read_frame().await.unwrap();
        assert_eq!(inbound, Some(Inbound::Data(Message::text("Hello"))));
    }

    #[tokio::test]
    async fn test_reassembles_fragments_around_control_frames() {
        let mut bytes = client_frame(0x01, b"Hel");
        bytes.extend(client_frame(0x89, b"beat"));
        bytes.extend(client_frame(0x80, b"lo"));
        let mut reader = reader(bytes, 1024);

        assert_eq!(reader.read_frame().await.unwrap(), None);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Inbound::Ping(Bytes::from_static(b"beat")))
        );
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Inbound::Data(Message::text("Hello")))
        );
    }

    #[tokio::test]
    async fn test_unmasked_frame_is_protocol_error() {
        let mut reader = reader(vec![0x81, 0x02, b'h', b'i'], 1024);
        assert!(matches!(
            reader.read_frame().await,
            Err(WebSocketError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_reserved_bits_and_opcodes_rejected() {
        let mut rsv = reader(client_frame(0xA1, b"x"), 1024);
        assert!(matches!(rsv.read_frame().await, Err(WebSocketError::Protocol(_))));

        let mut opcode = reader(client_frame(0x83, b"x"), 1024);
        assert!(matches!(opcode.read_frame().await, Err(WebSocketError::Protocol(_))));

        // RSV1 without negotiated compression
        let mut compressed = reader(client_frame(0xC1, b"x"), 1024);
        assert!(matches!(compressed.read_frame().await, Err(WebSocketError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_control_frame_rules() {
        let mut fragmented = reader(client_frame(0x09, b"x"), 1024);
        assert!(matches!(fragmented.read_frame().await, Err(WebSocketError::Protocol(_))));

        let mut oversized = reader(client_frame(0x89, &[0u8; 126]), 1024);
        assert!(matches!(oversized.read_frame().await, Err(WebSocketError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_stray_continuation_rejected() {
        let mut reader = reader(client_frame(0x80, b"orphan"), 1024);
        assert!(matches!(reader.read_frame().await, Err(WebSocketError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_close_frame_decoded() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");
        let mut reader = reader(client_frame(0x88, &payload), 1024);
        match reader.read_frame().await.unwrap() {
            Some(Inbound::Close(frame)) => {
                assert_eq!(frame.code, CloseCode::NORMAL);
                assert_eq!(frame.reason, "done");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_message_is_skipped() {
        let mut bytes = client_frame(0x81, &[b'a'; 2048]);
        bytes.extend(client_frame(0x88, &1000u16.to_be_bytes()));
        let mut reader = reader(bytes, 1024);

        match reader.read_frame().await {
            Err(WebSocketError::MessageTooBig { size, limit }) => {
                assert_eq!(size, 2048);
                assert_eq!(limit, 1024);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The oversize payload was skipped and the stream is still in sync.
        assert!(matches!(
            reader.read_frame().await.unwrap(),
            Some(Inbound::Close(_))
        ));
    }

    #[tokio::test]
    async fn test_oversize_fragments_are_discarded() {
        let mut bytes = client_frame(0x02, &[1u8; 600]);
        bytes.extend(client_frame(0x00, &[2u8; 600]));
        bytes.extend(client_frame(0x80, &[3u8; 600]));
        bytes.extend(client_frame(0x82, b"ok"));
        let mut reader = reader(bytes, 1000);

        assert_eq!(reader.read_frame().await.unwrap(), None);
        assert!(matches!(
            reader.read_frame().await,
            Err(WebSocketError::MessageTooBig { size: 1200, .. })
        ));
        assert_eq!(reader.read_frame().await.unwrap(), None);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Inbound::Data(Message::binary(&b"ok"[..])))
        );
    }

    #[tokio::test]
    async fn test_compressed_message_inflated() {
        let compressed = deflate::deflate(
            b"compressible compressible compressible",
            flate2::Compression::default(),
        )
        .unwrap();
        let mut reader = FrameReader::new(
            std::io::Cursor::new(client_frame(0xC1, &compressed)),
            1024,
            true,
        );
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Inbound::Data(Message::text(
                "compressible compressible compressible"
            )))
        );
    }

    #[tokio::test]
    async fn test_truncated_stream_is_transport_error() {
        let mut bytes = client_frame(0x81, b"Hello");
        bytes.truncate(bytes.len() - 2);
        let mut reader = reader(bytes, 1024);
        assert!(matches!(
            reader.read_frame().await,
            Err(WebSocketError::TransportRead(_))
        ));
    }
}
