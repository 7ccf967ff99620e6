//! RFC 6455 opening handshake, server side.

use crate::deflate::DeflateConfig;
use crate::error::{WebSocketError, WebSocketResult};
use crate::options::Options;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{
    CONNECTION, HeaderName, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};
use tungstenite::handshake::derive_accept_key;

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Whether `request` asks for a WebSocket upgrade.
///
/// Only the `Connection` and `Upgrade` headers are looked at; the rest of
/// the handshake is validated when the request is served.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    header_has_token(request.headers(), CONNECTION, "upgrade")
        && header_has_token(request.headers(), UPGRADE, "websocket")
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    header_tokens(headers, name).any(|t| t.eq_ignore_ascii_case(token))
}

fn header_tokens(headers: &HeaderMap, name: HeaderName) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Default fallback for requests that are not upgrades: 426 Upgrade Required.
pub fn upgrade_required<B>(_request: &Request<B>) -> Response<Bytes> {
    let mut response = plain_response(StatusCode::UPGRADE_REQUIRED, "Upgrade Required");
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    response
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(body.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn bad_request(reason: &str) -> Response<Bytes> {
    tracing::warn!(reason, "Rejected WebSocket handshake");
    plain_response(StatusCode::BAD_REQUEST, "Bad Request")
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub accept: String,
    pub subprotocol: Option<String>,
    pub deflate: Option<DeflateConfig>,
}

impl Negotiated {
    /// The `101 Switching Protocols` response.
    pub fn response(&self) -> WebSocketResult<Response<()>> {
        let mut response = Response::new(());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

        let headers = response.headers_mut();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, header_value(&self.accept)?);
        if let Some(protocol) = &self.subprotocol {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value(protocol)?);
        }
        if let Some(deflate) = &self.deflate {
            headers.insert(
                SEC_WEBSOCKET_EXTENSIONS,
                header_value(&deflate.response_header())?,
            );
        }
        Ok(response)
    }
}

fn header_value(value: &str) -> WebSocketResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| WebSocketError::Handshake(format!("invalid header value: {e}")))
}

/// Validate an upgrade request and pick the subprotocol and extensions.
///
/// On failure the returned response should be sent to the client as is.
pub(crate) fn negotiate<B>(
    request: &Request<B>,
    options: &Options,
) -> Result<Negotiated, Response<Bytes>> {
    if request.method() != Method::GET {
        return Err(bad_request("method is not GET"));
    }
    if request.version() < Version::HTTP_11 {
        return Err(bad_request("HTTP version below 1.1"));
    }
    if !is_upgrade_request(request) {
        return Err(bad_request("missing Connection or Upgrade header"));
    }

    let headers = request.headers();
    let version = headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if version != Some(WEBSOCKET_VERSION) {
        tracing::warn!(version = ?version, "Rejected WebSocket handshake with unsupported version");
        let mut response = plain_response(StatusCode::UPGRADE_REQUIRED, "Upgrade Required");
        response.headers_mut().insert(
            SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WEBSOCKET_VERSION),
        );
        return Err(response);
    }

    let Some(key) = headers.get(SEC_WEBSOCKET_KEY).map(|k| k.as_bytes()) else {
        return Err(bad_request("missing Sec-WebSocket-Key"));
    };
    match STANDARD.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(bad_request("Sec-WebSocket-Key is not 16 base64 bytes")),
    }

    let subprotocol = select_subprotocol(headers, &options.subprotocols);
    if subprotocol.is_none() && options.require_subprotocol {
        return Err(bad_request("no acceptable subprotocol offered"));
    }

    let deflate = if options.compression_enabled() {
        DeflateConfig::negotiate(headers)
    } else {
        None
    };

    Ok(Negotiated {
        accept: derive_accept_key(key),
        subprotocol,
        deflate,
    })
}

/// First server subprotocol the client also offered.
fn select_subprotocol(headers: &HeaderMap, supported: &[String]) -> Option<String> {
    let offered: Vec<&str> = header_tokens(headers, SEC_WEBSOCKET_PROTOCOL).collect();
    supported
        .iter()
        .find(|protocol| offered.contains(&protocol.as_str()))
        .cloned()
}

/// Copy the parts of a request a handler may look at.
///
/// Extensions are not carried over.
pub(crate) fn snapshot<B>(request: &Request<B>) -> Request<()> {
    let mut copy = Request::new(());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}
