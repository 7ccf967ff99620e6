//! WebSocket connection management.
//!
//! A [`Connection`] owns its byte stream through two tasks: a reader that
//! assembles inbound messages onto the receive stream and a writer that
//! serialises every outbound frame, pings included. The state moves
//! monotonically through [`ConnectionState`]; the close cause is published
//! once through the connection's [`ConnectionContext`].

use crate::close::{CloseCause, CloseFrame};
use crate::context::{CancelSource, ConnectionContext};
use crate::deflate::DeflateConfig;
use crate::error::{WebSocketError, WebSocketResult};
use crate::frame::{FrameReader, FrameWriter};
use crate::message::{Message, PreparedMessage};
use crate::options::Options;
use crate::transport;
use bytes::Bytes;
use flate2::Compression;
use futures::Stream;
use http::Request;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot, watch};

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Capacity of the receive stream.
const INBOUND_QUEUE: usize = 16;
/// Capacity of the outbound queue; submitters wait for the writer.
const OUTBOUND_QUEUE: usize = 1;
/// Reader, writer and handler.
const CONNECTION_TASKS: usize = 3;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Connection is being established
    Connecting,
    /// Connection is open and ready
    Open,
    /// A close frame was sent or received
    Closing,
    /// Transport torn down
    Closed,
}

/// A frame waiting for the writer, with the submitter's acknowledgement.
pub(crate) struct WriteRequest {
    pub frame: Bytes,
    pub ack: oneshot::Sender<WebSocketResult<()>>,
}

/// Frames produced by the connection itself.
pub(crate) enum Control {
    Pong(Bytes),
    Close(CloseFrame),
}

#[derive(Default)]
struct CloseHandshake {
    /// Frame of a locally initiated close
    local: Option<CloseFrame>,
    local_error: Option<WebSocketError>,
    sent: bool,
    received: Option<CloseFrame>,
    /// Tear down as soon as the close frame is out
    abort_after_send: bool,
}

/// Everything needed to open a connection over an upgraded stream.
pub(crate) struct ConnectionParts {
    pub id: ConnectionId,
    pub request: Request<()>,
    pub subprotocol: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub options: Arc<Options>,
    pub deflate: Option<DeflateConfig>,
}

/// State shared by the public handles and the connection tasks.
pub(crate) struct Shared {
    pub id: ConnectionId,
    request: Request<()>,
    subprotocol: String,
    remote_addr: Option<SocketAddr>,
    pub options: Arc<Options>,
    compression: Option<Compression>,
    state: watch::Sender<ConnectionState>,
    cancel: CancelSource,
    handshake: Mutex<CloseHandshake>,
    inbound: Mutex<Option<mpsc::Sender<Message>>>,
    outbound: mpsc::Sender<WriteRequest>,
    control: mpsc::UnboundedSender<Control>,
    pending: AtomicUsize,
    done: watch::Sender<bool>,
}

impl Shared {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move the state forward; never backwards. Leaving the open state
    /// ends the receive stream.
    fn advance(&self, to: ConnectionState) -> bool {
        let changed = self.transition(to);
        if changed && to >= ConnectionState::Closing {
            self.end_stream();
        }
        changed
    }

    fn transition(&self, to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(connection_id = %self.id, state = ?to, "Connection state changed");
        }
        changed
    }

    fn end_stream(&self) {
        self.inbound.lock().take();
    }

    /// Resolve once the state is at least `state`.
    pub async fn reached(&self, state: ConnectionState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|current| *current >= state).await;
    }

    pub fn already_closed(&self) -> WebSocketError {
        WebSocketError::AlreadyClosed(self.cancel.cause())
    }

    /// Record `cause` if none is set yet and tear the transport down.
    pub fn teardown(&self, cause: CloseCause) {
        self.cancel.cancel(cause);
        if self.advance(ConnectionState::Closed) {
            match self.cancel.cause() {
                Some(cause) if cause.was_clean => {
                    tracing::debug!(connection_id = %self.id, cause = %cause, "Connection closed");
                }
                Some(cause) => {
                    tracing::warn!(connection_id = %self.id, cause = %cause, "Connection closed uncleanly");
                }
                None => {}
            }
        }
    }

    /// Start a locally initiated close handshake.
    ///
    /// Returns false when the connection already left the open state.
    pub fn begin_close(
        self: &Arc<Self>,
        frame: CloseFrame,
        error: Option<WebSocketError>,
        abort_after_send: bool,
    ) -> bool {
        if !self.advance(ConnectionState::Closing) {
            return false;
        }
        {
            let mut handshake = self.handshake.lock();
            handshake.local = Some(frame.clone());
            handshake.local_error = error;
            handshake.abort_after_send = abort_after_send;
        }
        let _ = self.control.send(Control::Close(frame.clone()));
        self.spawn_close_timer(frame);
        true
    }

    /// Fail the connection: the cause is final now, the close frame is
    /// sent best-effort.
    pub fn fail(self: &Arc<Self>, frame: CloseFrame, error: WebSocketError) {
        tracing::warn!(connection_id = %self.id, code = frame.code.0, error = %error, "Failing connection");
        self.cancel.cancel(CloseCause::unclean(frame.clone(), Some(error)));
        if !self.begin_close(frame, None, true) {
            self.teardown(CloseCause::abnormal(None));
        }
    }

    /// The transport broke or a deadline passed.
    pub fn transport_lost(&self, error: WebSocketError) {
        let local = self.handshake.lock().local.clone();
        let cause = match (self.state(), local) {
            (ConnectionState::Closing, Some(frame)) => CloseCause::unclean(frame, Some(error)),
            _ => CloseCause::abnormal(Some(error)),
        };
        self.teardown(cause);
    }

    /// A close frame arrived from the peer.
    pub fn close_received(self: &Arc<Self>, frame: CloseFrame) {
        tracing::debug!(connection_id = %self.id, code = frame.code.0, "Close frame received");
        let initiated_by_peer = self.transition(ConnectionState::Closing);
        let sent = {
            let mut handshake = self.handshake.lock();
            handshake.received = Some(frame.clone());
            handshake.sent
        };

        if initiated_by_peer {
            // The cause is visible before the receive stream ends.
            self.cancel.cancel(CloseCause::clean(frame.clone()));
            self.end_stream();
            // Echo the peer's code; 1005 goes back as an empty payload.
            let _ = self.control.send(Control::Close(frame.clone()));
            self.spawn_close_timer(frame);
        } else if sent {
            self.finish_close();
        }
    }

    /// The writer put our close frame on the wire.
    pub fn close_sent(&self) {
        let finished = {
            let mut handshake = self.handshake.lock();
            handshake.sent = true;
            handshake.abort_after_send || handshake.received.is_some()
        };
        if finished {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        let cause = {
            let mut handshake = self.handshake.lock();
            let error = handshake.local_error.take().map(Arc::new);
            match (handshake.local.clone(), handshake.received.clone()) {
                (Some(local), Some(_)) => CloseCause {
                    frame: local,
                    was_clean: true,
                    error,
                },
                (Some(local), None) => CloseCause {
                    frame: local,
                    was_clean: false,
                    error,
                },
                (None, Some(peer)) => CloseCause::clean(peer),
                (None, None) => CloseCause::abnormal(None),
            }
        };
        self.teardown(cause);
    }

    fn spawn_close_timer(self: &Arc<Self>, frame: CloseFrame) {
        let shared = Arc::clone(self);
        let timeout = self.options.handshake_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.reached(ConnectionState::Closed) => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::debug!(connection_id = %shared.id, "Close handshake timed out");
                    shared.teardown(CloseCause::unclean(
                        frame,
                        Some(WebSocketError::Timeout("close handshake")),
                    ));
                }
            }
        });
    }

    /// Hand an inbound message to the receive stream.
    ///
    /// Returns false when the reader should stop.
    pub async fn deliver(&self, message: Message) -> bool {
        let Some(inbound) = self.inbound.lock().clone() else {
            // Closing: drop data while waiting for the close reply.
            return self.cancel.cause().is_none();
        };

        let mut state = self.state.subscribe();
        tokio::select! {
            biased;

            _ = state.wait_for(|s| *s >= ConnectionState::Closing) => self.cancel.cause().is_none(),
            sent = tokio::time::timeout(self.options.read_interval, inbound.send(message)) => {
                match sent {
                    // A handler that dropped its stream just loses the message.
                    Ok(_) => true,
                    Err(_) => {
                        self.transport_lost(WebSocketError::Timeout("read"));
                        false
                    }
                }
            }
        }
    }

    pub fn queue_pong(&self, payload: Bytes) {
        let _ = self.control.send(Control::Pong(payload));
    }

    /// One of the connection tasks finished.
    pub fn task_exited(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.send_replace(true);
            tracing::debug!(connection_id = %self.id, "Connection finished");
        }
    }

    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    async fn submit(&self, frame: Bytes) -> WebSocketResult<()> {
        if self.state() != ConnectionState::Open {
            return Err(self.already_closed());
        }

        let (ack, acked) = oneshot::channel();
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;

            _ = state.wait_for(|s| *s >= ConnectionState::Closing) => {
                return Err(self.already_closed());
            }
            sent = self.outbound.send(WriteRequest { frame, ack }) => {
                if sent.is_err() {
                    return Err(self.already_closed());
                }
            }
        }

        acked.await.unwrap_or_else(|_| Err(self.already_closed()))
    }

    async fn shutdown_with(self: &Arc<Self>, frame: CloseFrame) -> WebSocketResult<CloseCause> {
        frame.validate()?;
        self.begin_close(frame, None, false);
        self.reached(ConnectionState::Closed).await;
        Ok(self
            .cancel
            .cause()
            .unwrap_or_else(|| CloseCause::abnormal(None)))
    }

    fn close(&self) {
        self.teardown(CloseCause::abnormal(None));
    }
}

/// A WebSocket connection, lent to the handler for the duration of its run.
///
/// The handler receives `&Connection`, so the connection cannot outlive
/// the handler; code that needs to observe or close the connection from
/// elsewhere takes a [`ConnectionHandle`].
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    inbound: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl Connection {
    /// Start the reader and writer tasks over an upgraded stream.
    pub(crate) fn open<S>(io: S, parts: ConnectionParts) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = Arc::clone(&parts.options);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id: parts.id,
            request: parts.request,
            subprotocol: parts.subprotocol.unwrap_or_default(),
            remote_addr: parts.remote_addr,
            compression: parts.deflate.and(options.compression()),
            options: parts.options,
            state: watch::channel(ConnectionState::Connecting).0,
            cancel: CancelSource::new(),
            handshake: Mutex::new(CloseHandshake::default()),
            inbound: Mutex::new(Some(inbound_tx)),
            outbound: outbound_tx,
            control: control_tx,
            pending: AtomicUsize::new(CONNECTION_TASKS),
            done: watch::channel(false).0,
        });

        let (read_half, write_half) = tokio::io::split(io);
        let reader = FrameReader::new(
            BufReader::with_capacity(options.read_buffer_size, read_half),
            options.read_limit,
            parts.deflate.is_some(),
        );
        let writer = FrameWriter::new(BufWriter::with_capacity(
            options.write_buffer_size,
            write_half,
        ));

        shared.advance(ConnectionState::Open);
        tokio::spawn(transport::read_loop(Arc::clone(&shared), reader));
        tokio::spawn(transport::write_loop(
            Arc::clone(&shared),
            writer,
            outbound_rx,
            control_rx,
        ));

        Self {
            shared,
            inbound: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Unique connection identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Copy of the upgrade request.
    pub fn request(&self) -> &Request<()> {
        &self.shared.request
    }

    /// Negotiated subprotocol, empty if none.
    pub fn subprotocol(&self) -> &str {
        &self.shared.subprotocol
    }

    /// Peer address, when the upgrade path knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Take the receive stream.
    ///
    /// The stream yields text and binary messages in wire order and ends
    /// when the connection leaves the open state. It can be taken once;
    /// later calls return an already finished stream.
    pub fn read(&self) -> ReceiveStream {
        let rx = self.inbound.lock().take();
        if rx.is_none() {
            tracing::debug!(connection_id = %self.shared.id, "Receive stream already taken");
        }
        ReceiveStream { rx }
    }

    /// Send a message and wait until it is written.
    ///
    /// Fails with [`WebSocketError::AlreadyClosed`] once the connection has
    /// left the open state. Close frames go through
    /// [`Connection::shutdown_with`] instead.
    pub async fn write(&self, message: Message) -> WebSocketResult<()> {
        Message::check_writable(message.message_type, message.len())?;
        let frame = message.encode(self.shared.compression)?;
        self.shared.submit(frame).await
    }

    /// Send a prepared message.
    pub async fn write_prepared(&self, message: &PreparedMessage) -> WebSocketResult<()> {
        let frame = message.frame(self.shared.compression)?;
        self.shared.submit(frame).await
    }

    /// Send a text message.
    pub async fn write_text(&self, text: impl Into<String>) -> WebSocketResult<()> {
        self.write(Message::text(text)).await
    }

    /// Send a binary message.
    pub async fn write_binary(&self, data: impl Into<Bytes>) -> WebSocketResult<()> {
        self.write(Message::binary(data)).await
    }

    /// Serialize `value` as JSON and send it as text.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> WebSocketResult<()> {
        self.write(Message::json(value)?).await
    }

    /// Cancellation handle carrying the close cause.
    pub fn context(&self) -> ConnectionContext {
        self.shared.cancel.context()
    }

    /// Close gracefully with `frame` and wait for the connection to close.
    ///
    /// Waits for the peer's close frame or the handshake timeout, whichever
    /// comes first. If the connection is already closing, only waits.
    pub async fn shutdown_with(&self, frame: CloseFrame) -> WebSocketResult<CloseCause> {
        self.shared.shutdown_with(frame).await
    }

    /// Tear the connection down immediately without a close frame.
    ///
    /// Calling it more than once is harmless.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Wait until the reader, the writer and the handler are done.
    ///
    /// Never call this from the connection's own handler: it waits for the
    /// handler to return.
    pub async fn wait(&self) {
        self.shared.wait().await;
    }

    /// A cloneable handle for observing and closing the connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("subprotocol", &self.shared.subprotocol)
            .finish()
    }
}

/// Inbound text and binary messages of a connection.
#[derive(Debug)]
pub struct ReceiveStream {
    rx: Option<mpsc::Receiver<Message>>,
}

impl ReceiveStream {
    /// Next message, or `None` once the connection left the open state.
    pub async fn recv(&mut self) -> Option<Message> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Stream for ReceiveStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Control-plane handle to a connection.
///
/// Unlike [`Connection`] it may be kept after the handler returns, but it
/// cannot read or write messages.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Unique connection identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Negotiated subprotocol, empty if none.
    pub fn subprotocol(&self) -> &str {
        &self.shared.subprotocol
    }

    /// Peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Cancellation handle carrying the close cause.
    pub fn context(&self) -> ConnectionContext {
        self.shared.cancel.context()
    }

    /// Close gracefully with `frame` and wait for the connection to close.
    pub async fn shutdown_with(&self, frame: CloseFrame) -> WebSocketResult<CloseCause> {
        self.shared.shutdown_with(frame).await
    }

    /// Start a graceful close without waiting for it.
    pub(crate) fn begin_shutdown(&self, frame: CloseFrame) {
        self.shared.begin_close(frame, None, false);
    }

    /// Tear the connection down immediately without a close frame.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Wait until the reader, the writer and the handler are done.
    pub async fn wait(&self) {
        self.shared.wait().await;
    }

    /// Whether the reader, the writer and the handler are done.
    pub fn is_finished(&self) -> bool {
        self.shared.is_done()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;
    use crate::frame::{OpCode, apply_mask, encode_frame};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn open(mut options: Options) -> (Connection, DuplexStream) {
        options.set_defaults();
        let (server, client) = tokio::io::duplex(64 * 1024);
        let connection = Connection::open(
            server,
            ConnectionParts {
                id: "conn-test".to_string(),
                request: Request::new(()),
                subprotocol: None,
                remote_addr: None,
                options: Arc::new(options),
                deflate: None,
            },
        );
        (connection, client)
    }

    fn client_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let frame = encode_frame(opcode, false, payload);
        let mut out = frame[..frame.len() - payload.len()].to_vec();
        out[1] |= 0x80;
        out.extend_from_slice(&KEY);
        let mut body = payload.to_vec();
        apply_mask(&mut body, KEY);
        out.extend_from_slice(&body);
        out
    }

    async fn server_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1] & 0x80, 0, "server frames are never masked");
        let len = match head[1] & 0x7F {
            126 => usize::from(client.read_u16().await.unwrap()),
            127 => client.read_u64().await.unwrap() as usize,
            len => usize::from(len),
        };
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        (head[0], payload)
    }

    #[tokio::test]
    async fn test_read_and_write_messages() {
        let (connection, mut client) = open(Options::default());
        assert!(connection.is_open());

        client
            .write_all(&client_frame(OpCode::Text, b"hi"))
            .await
            .unwrap();
        let mut incoming = connection.read();
        assert_eq!(incoming.recv().await, Some(Message::text("hi")));

        connection.write_text("yo").await.unwrap();
        assert_eq!(server_frame(&mut client).await, (0x81, b"yo".to_vec()));

        // The stream can only be taken once.
        assert_eq!(connection.read().recv().await, None);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (_connection, mut client) = open(Options::default());
        client
            .write_all(&client_frame(OpCode::Ping, b"beat"))
            .await
            .unwrap();
        assert_eq!(server_frame(&mut client).await, (0x8A, b"beat".to_vec()));
    }

    #[tokio::test]
    async fn test_local_close_handshake() {
        let (connection, mut client) = open(Options::default());
        let handle = connection.handle();

        let closing = tokio::spawn(async move { handle.shutdown_with(CloseFrame::normal()).await });

        let (b0, payload) = server_frame(&mut client).await;
        assert_eq!(b0, 0x88);
        assert_eq!(CloseFrame::decode(&payload).unwrap(), CloseFrame::normal());
        assert_eq!(connection.state(), ConnectionState::Closing);
        // Not final until the peer answers.
        assert!(!connection.context().is_cancelled());

        client
            .write_all(&client_frame(OpCode::Close, &payload))
            .await
            .unwrap();
        let cause = closing.await.unwrap().unwrap();
        assert_eq!(cause.code(), CloseCode::NORMAL);
        assert!(cause.was_clean);
        assert_eq!(connection.state(), ConnectionState::Closed);

        match connection.write_text("late").await {
            Err(WebSocketError::AlreadyClosed(Some(cause))) => {
                assert_eq!(cause.code(), CloseCode::NORMAL)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_is_echoed() {
        let (connection, mut client) = open(Options::default());
        let mut incoming = connection.read();

        let frame = CloseFrame::new(CloseCode::GOING_AWAY, "bye").unwrap();
        client
            .write_all(&client_frame(OpCode::Close, &frame.encode()))
            .await
            .unwrap();

        assert_eq!(incoming.recv().await, None);
        let cause = connection.context().cancelled().await;
        assert_eq!(cause.frame, frame);
        assert!(cause.was_clean);

        let (b0, payload) = server_frame(&mut client).await;
        assert_eq!(b0, 0x88);
        assert_eq!(CloseFrame::decode(&payload).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_unanswered_close_times_out() {
        let (connection, mut client) = open(Options {
            handshake_timeout: Duration::from_millis(100),
            ..Default::default()
        });

        let cause = connection
            .shutdown_with(CloseFrame::going_away())
            .await
            .unwrap();
        assert_eq!(cause.code(), CloseCode::GOING_AWAY);
        assert!(!cause.was_clean);
        assert!(matches!(
            cause.error.as_deref(),
            Some(WebSocketError::Timeout("close handshake"))
        ));

        let (b0, _) = server_frame(&mut client).await;
        assert_eq!(b0, 0x88);
    }

    #[tokio::test]
    async fn test_protocol_error_fails_with_1002() {
        let (connection, mut client) = open(Options::default());

        // Unmasked client frame
        client.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

        let (b0, payload) = server_frame(&mut client).await;
        assert_eq!(b0, 0x88);
        assert_eq!(
            CloseFrame::decode(&payload).unwrap().code,
            CloseCode::PROTOCOL_ERROR
        );

        let cause = connection.context().cancelled().await;
        assert_eq!(cause.code(), CloseCode::PROTOCOL_ERROR);
        assert!(!cause.was_clean);
        assert!(matches!(
            cause.error.as_deref(),
            Some(WebSocketError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_abnormal() {
        let (connection, client) = open(Options::default());
        drop(client);

        let cause = connection.context().cancelled().await;
        assert_eq!(cause.code(), CloseCode::ABNORMAL);
        assert!(!cause.was_clean);
        assert!(connection.state() == ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_wait_counts_the_handler() {
        let (connection, _client) = open(Options::default());
        let handle = connection.handle();

        connection.close();
        connection.close();
        assert_eq!(
            connection.context().cause().map(|c| c.code()),
            Some(CloseCode::ABNORMAL)
        );

        // Reader and writer exit; the handler slot is still open.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        connection.shared.task_exited();
        tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap();
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_control_messages_are_validated_before_writing() {
        let (connection, _client) = open(Options::default());
        assert!(matches!(
            connection.write(Message::close(&CloseFrame::normal())).await,
            Err(WebSocketError::InvalidCloseFrame(_))
        ));
        assert!(matches!(
            connection.write(Message::ping(vec![0u8; 200])).await,
            Err(WebSocketError::Protocol(_))
        ));
        assert!(matches!(
            connection
                .shutdown_with(CloseFrame {
                    code: CloseCode::NORMAL,
                    reason: "x".repeat(200),
                })
                .await,
            Err(WebSocketError::InvalidCloseFrame(_))
        ));
        assert!(connection.is_open());
    }
}
