//! permessage-deflate (RFC 7692).
//!
//! The server always declines context takeover for its own direction, so
//! every outbound message is compressed with a fresh raw-deflate stream.
//! Inbound messages share one decompressor for the lifetime of the
//! connection, which handles clients that keep their context as well as
//! clients that reset it.

use crate::error::{WebSocketError, WebSocketResult};
use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use http::HeaderMap;
use http::header::SEC_WEBSOCKET_EXTENSIONS;

/// Extension token.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Empty stored block that terminates every sync-flushed message.
const TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Parameters agreed with the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeflateConfig {
    /// The client promised to reset its compression context per message
    pub client_no_context_takeover: bool,
}

impl DeflateConfig {
    /// Select the first acceptable offer in the request headers.
    ///
    /// An offer is acceptable when every parameter is known and
    /// `server_max_window_bits`, if present, is 15: the compressor always
    /// uses the full window.
    pub fn negotiate(headers: &HeaderMap) -> Option<Self> {
        headers
            .get_all(SEC_WEBSOCKET_EXTENSIONS)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .find_map(parse_offer)
    }

    /// `Sec-WebSocket-Extensions` response value.
    pub fn response_header(&self) -> String {
        let mut value = format!("{PERMESSAGE_DEFLATE}; server_no_context_takeover");
        if self.client_no_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        value
    }
}

fn parse_offer(offer: &str) -> Option<DeflateConfig> {
    let mut params = offer.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) {
        return None;
    }

    let mut config = DeflateConfig::default();
    let mut seen = Vec::new();
    for param in params.filter(|p| !p.is_empty()) {
        let (name, value) = match param.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (param, None),
        };
        if seen.contains(&name) {
            return None;
        }
        seen.push(name);

        match (name, value) {
            ("server_no_context_takeover", None) => {}
            ("client_no_context_takeover", None) => config.client_no_context_takeover = true,
            ("server_max_window_bits", Some(bits)) => {
                if bits.parse::<u8>().ok()? != 15 {
                    return None;
                }
            }
            ("client_max_window_bits", None) => {}
            ("client_max_window_bits", Some(bits)) => {
                if !(8..=15).contains(&bits.parse::<u8>().ok()?) {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(config)
}

/// Map a configured level to a compressor setting; 0 disables compression.
pub(crate) fn compression(level: i32) -> Option<Compression> {
    match level {
        0 => None,
        -1 => Some(Compression::default()),
        level => u32::try_from(level).ok().map(Compression::new),
    }
}

/// Compress one message with a fresh raw-deflate stream.
pub(crate) fn deflate(payload: &[u8], level: Compression) -> WebSocketResult<Bytes> {
    let mut compress = Compress::new(level, false);
    let mut out = Vec::with_capacity(payload.len() / 2 + 64);

    loop {
        if out.capacity() - out.len() < 64 {
            out.reserve(out.capacity().max(64));
        }
        let consumed = compress.total_in() as usize;
        compress
            .compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync)
            .map_err(std::io::Error::other)?;
        if compress.total_in() as usize == payload.len() && out.len() < out.capacity() {
            break;
        }
    }

    if out.ends_with(&TAIL) {
        out.truncate(out.len() - TAIL.len());
    }
    Ok(Bytes::from(out))
}

/// Connection-scoped decompressor.
pub(crate) struct Inflater {
    inner: Decompress,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    /// Decompress one message, failing once the output exceeds `limit`.
    pub fn inflate(&mut self, payload: &[u8], limit: usize) -> WebSocketResult<Bytes> {
        let mut input = Vec::with_capacity(payload.len() + TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&TAIL);

        let mut out = Vec::with_capacity((payload.len() * 2).clamp(64, limit.max(64)));
        let mut offset = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();

            self.inner
                .decompress_vec(&input[offset..], &mut out, FlushDecompress::Sync)
                .map_err(|e| WebSocketError::Protocol(format!("invalid compressed payload: {e}")))?;
            offset += (self.inner.total_in() - before_in) as usize;

            if out.len() > limit {
                return Err(WebSocketError::MessageTooBig {
                    size: out.len() as u64,
                    limit,
                });
            }

            let progressed =
                self.inner.total_in() != before_in || self.inner.total_out() != before_out;
            if offset >= input.len() && (out.len() < out.capacity() || !progressed) {
                break;
            }
            if !progressed {
                return Err(WebSocketError::Protocol(
                    "compressed payload did not make progress".to_string(),
                ));
            }
        }

        Ok(Bytes::from(out))
    }
}
