//! WebSocket server implementation.

use crate::close::CloseFrame;
use crate::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionParts};
use crate::error::{WebSocketError, WebSocketResult};
use crate::handler::{PanicSink, TracingPanicSink, WebSocketHandler, run_handler};
use crate::handshake::{self, Negotiated};
use crate::options::Options;
use crate::registry::{ConnectionRegistry, Registration};
use crate::upgrade::{HyperUpgrade, RawUpgrade, TcpUpgrade};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::time::timeout;

/// Response for requests that are not WebSocket upgrades.
pub type Fallback = Arc<dyn Fn(&Request<()>) -> Response<Bytes> + Send + Sync>;

/// How a shutdown treats live connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for handlers to finish on their own
    Drain,
    /// Send the close frame to every connection, then wait
    Graceful(CloseFrame),
    /// Tear every connection down without a close frame
    Force,
}

impl ShutdownMode {
    fn rank(&self) -> u8 {
        match self {
            Self::Drain => 0,
            Self::Graceful(_) => 1,
            Self::Force => 2,
        }
    }
}

/// Outcome of [`WebSocketServer::serve`].
#[derive(Debug)]
pub enum Served {
    /// The connection is open and its handler is running
    Upgraded(ConnectionHandle),
    /// Not an upgrade request; the fallback produced this response
    Fallback(Response<Bytes>),
    /// A malformed or unacceptable upgrade request
    Rejected(Response<Bytes>),
}

enum Decision {
    Upgrade(Negotiated),
    Respond(Served),
}

/// Builder for a [`WebSocketServer`].
pub struct WebSocketServerBuilder {
    options: Options,
    fallback: Option<Fallback>,
    panic_sink: Option<Arc<dyn PanicSink>>,
}

impl Default for WebSocketServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketServerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            fallback: None,
            panic_sink: None,
        }
    }

    /// Replace all options at once.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Set the bound on the upgrade and close handshakes.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    /// Set the longest allowed silence from the peer.
    pub fn read_interval(mut self, interval: Duration) -> Self {
        self.options.read_interval = interval;
        self
    }

    /// Set the deadline for a single write.
    pub fn write_interval(mut self, interval: Duration) -> Self {
        self.options.write_interval = interval;
        self
    }

    /// Set the keepalive ping cadence.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    /// Set the largest inbound message in bytes.
    pub fn read_limit(mut self, limit: usize) -> Self {
        self.options.read_limit = limit;
        self
    }

    /// Set the read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.options.read_buffer_size = size;
        self
    }

    /// Set the write buffer size.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.options.write_buffer_size = size;
        self
    }

    /// Set the acceptable subprotocols, most preferred first.
    pub fn subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Reject clients that offer none of the subprotocols.
    pub fn require_subprotocol(mut self, require: bool) -> Self {
        self.options.require_subprotocol = require;
        self
    }

    /// Set the deflate level; 0 disables compression.
    pub fn compression_level(mut self, level: i32) -> Self {
        self.options.compression_level = level;
        self
    }

    /// Respond to non-upgrade requests with `fallback`.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&Request<()>) -> Response<Bytes> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Report handler panics to `sink`.
    pub fn panic_sink<S: PanicSink>(mut self, sink: S) -> Self {
        self.panic_sink = Some(Arc::new(sink));
        self
    }

    /// Build the server with the given handler.
    pub fn build<H: WebSocketHandler>(self, handler: H) -> WebSocketResult<WebSocketServer<H>> {
        let fallback = self.fallback.unwrap_or_else(default_fallback);
        let panic_sink = match self.panic_sink {
            Some(sink) => sink,
            None => Arc::new(TracingPanicSink),
        };
        WebSocketServer::from_parts(self.options, handler, fallback, panic_sink)
    }
}

struct ServerInner<H> {
    options: Arc<Options>,
    handler: Arc<H>,
    fallback: Fallback,
    panic_sink: Arc<dyn PanicSink>,
    registry: ConnectionRegistry,
    shutdown: watch::Sender<Option<ShutdownMode>>,
}

/// WebSocket server.
///
/// Cheap to clone; clones share connections and shutdown state.
pub struct WebSocketServer<H: WebSocketHandler> {
    inner: Arc<ServerInner<H>>,
}

impl<H: WebSocketHandler> Clone for WebSocketServer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WebSocketServer<crate::handler::EchoHandler> {
    /// Create a builder for the server.
    pub fn builder() -> WebSocketServerBuilder {
        WebSocketServerBuilder::new()
    }
}

impl<H: WebSocketHandler> WebSocketServer<H> {
    /// Create a server; unset options get their defaults.
    pub fn new(options: Options, handler: H) -> WebSocketResult<Self> {
        Self::from_parts(options, handler, default_fallback(), Arc::new(TracingPanicSink))
    }

    fn from_parts(
        mut options: Options,
        handler: H,
        fallback: Fallback,
        panic_sink: Arc<dyn PanicSink>,
    ) -> WebSocketResult<Self> {
        options.set_defaults();
        options.validate()?;

        Ok(Self {
            inner: Arc::new(ServerInner {
                options: Arc::new(options),
                handler: Arc::new(handler),
                fallback,
                panic_sink,
                registry: ConnectionRegistry::new(),
                shutdown: watch::channel(None).0,
            }),
        })
    }

    /// Effective options, defaults applied.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Whether new connections are accepted.
    pub fn is_accepting(&self) -> bool {
        self.inner.registry.is_accepting()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Identifiers of the registered connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids()
    }

    /// Handle of a registered connection.
    pub fn connection(&self, id: &str) -> Option<ConnectionHandle> {
        self.inner.registry.get(id)
    }

    /// Serve one HTTP request.
    ///
    /// Non-upgrade requests go to the fallback. Upgrade requests are
    /// validated, upgraded through `upgrade`, and get a connection whose
    /// handler runs in a new task. Fails with
    /// [`WebSocketError::ServerClosed`] once shutdown has begun.
    pub async fn serve<U: RawUpgrade>(
        &self,
        request: Request<()>,
        upgrade: U,
    ) -> WebSocketResult<Served> {
        match self.decide(&request)? {
            Decision::Respond(served) => Ok(served),
            Decision::Upgrade(negotiated) => self
                .accept(request, negotiated, upgrade)
                .await
                .map(Served::Upgraded),
        }
    }

    fn decide(&self, request: &Request<()>) -> WebSocketResult<Decision> {
        if !self.is_accepting() {
            return Err(WebSocketError::ServerClosed);
        }
        if !handshake::is_upgrade_request(request) {
            return Ok(Decision::Respond(Served::Fallback((self.inner.fallback)(
                request,
            ))));
        }
        Ok(match handshake::negotiate(request, &self.inner.options) {
            Ok(negotiated) => Decision::Upgrade(negotiated),
            Err(response) => Decision::Respond(Served::Rejected(response)),
        })
    }

    async fn accept<U: RawUpgrade>(
        &self,
        request: Request<()>,
        negotiated: Negotiated,
        upgrade: U,
    ) -> WebSocketResult<ConnectionHandle> {
        let response = negotiated.response()?;
        let remote_addr = upgrade.remote_addr();

        let upgraded = timeout(self.inner.options.handshake_timeout, upgrade.upgrade(response));
        let io = match upgraded.await {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => return Err(WebSocketError::Handshake(format!("upgrade failed: {e}"))),
            Err(_) => return Err(WebSocketError::Timeout("handshake")),
        };

        let compression = negotiated.deflate.is_some();
        let connection = Connection::open(
            io,
            ConnectionParts {
                id: uuid::Uuid::new_v4().to_string(),
                request,
                subprotocol: negotiated.subprotocol,
                remote_addr,
                options: Arc::clone(&self.inner.options),
                deflate: negotiated.deflate,
            },
        );
        let handle = connection.handle();

        let Some(registration) = self.inner.registry.register(handle.clone()) else {
            // Shutdown began while the upgrade was in flight.
            connection.close();
            connection.shared.task_exited();
            return Err(WebSocketError::ServerClosed);
        };

        tracing::debug!(
            connection_id = %handle.id(),
            remote_addr = ?remote_addr,
            subprotocol = %handle.subprotocol(),
            compression,
            "WebSocket connection established"
        );

        tokio::spawn(run_handler(
            Arc::clone(&self.inner.handler),
            connection,
            Arc::clone(&self.inner.panic_sink),
        ));
        tokio::spawn(observe_shutdown(
            handle.clone(),
            self.inner.shutdown.subscribe(),
            registration,
        ));

        Ok(handle)
    }

    /// Serve one TCP connection: parse the HTTP head, then upgrade or
    /// answer with the fallback or rejection response.
    pub async fn serve_tcp(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> WebSocketResult<Served> {
        let read = TcpUpgrade::read_request(stream, Some(remote_addr));
        let (request, upgrade) = match timeout(self.inner.options.handshake_timeout, read).await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => return Err(WebSocketError::Handshake(format!("bad request head: {e}"))),
            Err(_) => return Err(WebSocketError::Timeout("handshake")),
        };

        match self.decide(&request)? {
            Decision::Upgrade(negotiated) => self
                .accept(request, negotiated, upgrade)
                .await
                .map(Served::Upgraded),
            Decision::Respond(served) => {
                if let Served::Fallback(response) | Served::Rejected(response) = &served {
                    upgrade.reject(response).await?;
                }
                Ok(served)
            }
        }
    }

    /// Serve a request received by a hyper server.
    ///
    /// Returns the response hyper must send. For upgrades this is the
    /// `101` response; the connection starts once hyper has written it.
    /// The hyper connection must be served with upgrades enabled.
    pub async fn serve_hyper<B>(
        &self,
        mut request: hyper::Request<B>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<Full<Bytes>> {
        let snapshot = handshake::snapshot(&request);
        let negotiated = match self.decide(&snapshot) {
            Ok(Decision::Upgrade(negotiated)) => negotiated,
            Ok(Decision::Respond(Served::Fallback(response) | Served::Rejected(response))) => {
                return response.map(Full::new);
            }
            Ok(Decision::Respond(Served::Upgraded(_))) | Err(_) => {
                return status_response(StatusCode::SERVICE_UNAVAILABLE);
            }
        };

        let (upgrade, response) = HyperUpgrade::new(&mut request, remote_addr);
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.accept(snapshot, negotiated, upgrade).await {
                tracing::warn!(error = %e, "WebSocket upgrade failed");
            }
        });

        match response.await {
            Ok(response) => response.map(|()| Full::new(Bytes::new())),
            Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Accept connections from `listener` until shutdown begins.
    pub async fn run(&self, listener: TcpListener) -> WebSocketResult<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "WebSocket server listening");

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.wait_for(Option::is_some) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            match server.serve_tcp(stream, peer).await {
                                Ok(_) | Err(WebSocketError::ServerClosed) => {}
                                Err(e) => {
                                    tracing::debug!(addr = %peer, error = %e, "Connection error");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        tracing::info!(addr = %addr, "WebSocket server stopped accepting");
        Ok(())
    }

    /// Bind `addr` and [`run`](Self::run).
    pub async fn listen<A: ToSocketAddrs>(&self, addr: A) -> WebSocketResult<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run(listener).await
    }

    /// Stop accepting and wait for every handler and connection to finish.
    ///
    /// No close frames are sent; handlers are expected to return on their own.
    ///
    /// ```
    /// use girder_websocket::{EchoHandler, WebSocketServer};
    ///
    /// # tokio_test::block_on(async {
    /// let server = WebSocketServer::builder().build(EchoHandler).unwrap();
    /// server.shutdown().await;
    /// assert!(!server.is_accepting());
    /// # });
    /// ```
    pub async fn shutdown(&self) {
        self.begin_shutdown(ShutdownMode::Drain);
        self.inner.registry.drained().await;
    }

    /// Stop accepting, close every connection with `frame`, and wait for
    /// every handler and connection to finish.
    pub async fn shutdown_with(&self, frame: CloseFrame) -> WebSocketResult<()> {
        frame.validate()?;
        self.begin_shutdown(ShutdownMode::Graceful(frame));
        self.inner.registry.drained().await;
        Ok(())
    }

    /// Stop accepting and tear every connection down now. Does not wait.
    pub fn close(&self) {
        self.begin_shutdown(ShutdownMode::Force);
    }

    /// Wait until no connection is registered.
    pub async fn wait(&self) {
        self.inner.registry.drained().await;
    }

    fn begin_shutdown(&self, mode: ShutdownMode) {
        self.inner.registry.stop_accepting();
        let escalated = self.inner.shutdown.send_if_modified(|current| {
            match current {
                Some(existing) if existing.rank() >= mode.rank() => false,
                _ => {
                    *current = Some(mode.clone());
                    true
                }
            }
        });
        if escalated {
            tracing::info!(
                mode = ?mode,
                connections = self.connection_count(),
                "WebSocket server shutting down"
            );
        }
    }
}

impl<H: WebSocketHandler> std::fmt::Debug for WebSocketServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("options", &self.inner.options)
            .field("connections", &self.connection_count())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

fn default_fallback() -> Fallback {
    Arc::new(handshake::upgrade_required::<()>)
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Route the server's shutdown signal to one connection and keep it
/// registered until it is finished.
async fn observe_shutdown(
    handle: ConnectionHandle,
    mut shutdown: watch::Receiver<Option<ShutdownMode>>,
    registration: Registration,
) {
    let mut applied: Option<u8> = None;
    loop {
        let mode = shutdown.borrow_and_update().clone();
        if let Some(mode) = mode
            && applied.is_none_or(|rank| rank < mode.rank())
        {
            applied = Some(mode.rank());
            match mode {
                ShutdownMode::Drain => {}
                ShutdownMode::Graceful(frame) => handle.begin_shutdown(frame),
                ShutdownMode::Force => handle.close(),
            }
        }

        tokio::select! {
            _ = handle.wait() => break,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    handle.wait().await;
                    break;
                }
            }
        }
    }

    drop(registration);
}
