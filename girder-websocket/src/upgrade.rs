//! Raw upgrade collaborators.
//!
//! A [`RawUpgrade`] hands the server the byte stream behind an HTTP
//! request once the `101 Switching Protocols` response has gone out. It is
//! consumed by value, so a request can be upgraded at most once.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Largest HTTP request head accepted on the TCP path.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// Turns an HTTP request into a raw byte stream.
#[async_trait]
pub trait RawUpgrade: Send + Sized + 'static {
    /// The upgraded stream.
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Send `response` and take over the stream.
    async fn upgrade(self, response: Response<()>) -> io::Result<Self::Io>;

    /// Address of the peer, if known.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Upgrade over a plain TCP stream whose request head was parsed by
/// [`TcpUpgrade::read_request`].
#[derive(Debug)]
pub struct TcpUpgrade {
    stream: BufReader<TcpStream>,
    remote_addr: Option<SocketAddr>,
}

impl TcpUpgrade {
    /// Read and parse the HTTP request head from `stream`.
    ///
    /// Bytes after the head stay buffered and are read as WebSocket data.
    pub async fn read_request(
        stream: TcpStream,
        remote_addr: Option<SocketAddr>,
    ) -> io::Result<(Request<()>, Self)> {
        let mut stream = BufReader::new(stream);
        let mut head = Vec::with_capacity(1024);

        loop {
            // One byte past the limit is enough to reject the head.
            let remaining = (MAX_REQUEST_HEAD + 1 - head.len()) as u64;
            let read = (&mut stream)
                .take(remaining)
                .read_until(b'\n', &mut head)
                .await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the request head",
                ));
            }
            if head.len() > MAX_REQUEST_HEAD {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            if head.ends_with(b"\r\n\r\n") || head == b"\r\n" {
                break;
            }
        }

        let request = parse_request(&head)?;
        Ok((
            request,
            Self {
                stream,
                remote_addr,
            },
        ))
    }

    /// Write a non-101 response and close the stream.
    pub async fn reject(mut self, response: &Response<Bytes>) -> io::Result<()> {
        let body = response.body();
        let mut head = response_head(response.status(), response.headers());
        head.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        head.extend_from_slice(body);

        let stream = self.stream.get_mut();
        stream.write_all(&head).await?;
        stream.shutdown().await
    }
}

#[async_trait]
impl RawUpgrade for TcpUpgrade {
    type Io = BufReader<TcpStream>;

    async fn upgrade(mut self, response: Response<()>) -> io::Result<Self::Io> {
        let mut head = response_head(response.status(), response.headers());
        head.extend_from_slice(b"\r\n");

        let stream = self.stream.get_mut();
        stream.write_all(&head).await?;
        stream.flush().await?;
        Ok(self.stream)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

fn parse_request(head: &[u8]) -> io::Result<Request<()>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed
        .parse(head)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if status.is_partial() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "incomplete request head",
        ));
    }

    let invalid = |e: http::Error| io::Error::new(io::ErrorKind::InvalidData, e);
    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or("GET"))
        .uri(parsed.path.unwrap_or("/"))
        .version(match parsed.version {
            Some(0) => http::Version::HTTP_10,
            _ => http::Version::HTTP_11,
        });
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder.body(()).map_err(invalid)
}

fn response_head(status: StatusCode, headers: &http::HeaderMap) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head
}

/// Upgrade through hyper's connection upgrade machinery.
///
/// The response is handed back to the hyper service through a oneshot;
/// the stream becomes available once hyper has written it.
pub struct HyperUpgrade {
    on_upgrade: hyper::upgrade::OnUpgrade,
    response: oneshot::Sender<Response<()>>,
    remote_addr: Option<SocketAddr>,
}

impl HyperUpgrade {
    /// Take the upgrade handle out of `request`.
    pub fn new<B>(
        request: &mut hyper::Request<B>,
        remote_addr: Option<SocketAddr>,
    ) -> (Self, oneshot::Receiver<Response<()>>) {
        let (response, rx) = oneshot::channel();
        let upgrade = Self {
            on_upgrade: hyper::upgrade::on(request),
            response,
            remote_addr,
        };
        (upgrade, rx)
    }
}

impl std::fmt::Debug for HyperUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperUpgrade")
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[async_trait]
impl RawUpgrade for HyperUpgrade {
    type Io = TokioIo<hyper::upgrade::Upgraded>;

    async fn upgrade(self, response: Response<()>) -> io::Result<Self::Io> {
        self.response.send(response).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "hyper service dropped the response")
        })?;
        let upgraded = self.on_upgrade.await.map_err(io::Error::other)?;
        Ok(TokioIo::new(upgraded))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_request_head() {
        let head = b"GET /chat?room=1 HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\r\n";
        let request = parse_request(head).unwrap();
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/chat");
        assert_eq!(request.uri().query(), Some("room=1"));
        assert_eq!(request.headers()["upgrade"], "websocket");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request(b"\x00\x01 nonsense\r\n\r\n").is_err());
    }

    #[test]
    fn test_response_head() {
        let mut headers = http::HeaderMap::new();
        headers.insert("upgrade", http::HeaderValue::from_static("websocket"));
        let head = response_head(StatusCode::SWITCHING_PROTOCOLS, &headers);
        assert_eq!(
            String::from_utf8(head).unwrap(),
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n"
        );
    }

    #[tokio::test]
    async fn test_tcp_upgrade_keeps_trailing_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nextra")
                .await
                .unwrap();
            let mut reply = vec![0u8; 64];
            let n = stream.read(&mut reply).await.unwrap();
            String::from_utf8_lossy(&reply[..n]).into_owned()
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let (request, upgrade) = TcpUpgrade::read_request(stream, Some(peer)).await.unwrap();
        assert_eq!(request.uri().path(), "/");
        assert_eq!(upgrade.remote_addr(), Some(peer));

        let mut response = Response::new(());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let mut io = upgrade.upgrade(response).await.unwrap();

        let mut extra = [0u8; 5];
        io.read_exact(&mut extra).await.unwrap();
        assert_eq!(&extra, b"extra");

        let reply = client.await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    }

    #[tokio::test]
    async fn test_request_line_without_newline_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let line = vec![b'a'; 4 * MAX_REQUEST_HEAD];
            // The server may stop reading before everything is sent.
            let _ = stream.write_all(&line).await;
            stream
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let err = TcpUpgrade::read_request(stream, Some(peer))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "request head too large");

        drop(client.await.unwrap());
    }
}
