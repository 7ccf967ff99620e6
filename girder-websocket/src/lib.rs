//! # Girder WebSocket
//!
//! Managed WebSocket server connections with a well-defined lifecycle.
//!
//! ## Features
//!
//! - Upgrade from a raw TCP stream or from a hyper request
//! - Subprotocol selection and `permessage-deflate` negotiation
//! - Read limits, read/write deadlines and keepalive pings
//! - Close handshake bookkeeping with an observable [`CloseCause`]
//! - Handler panics contained and reported as close code 1011
//! - Graceful, draining and forced server shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use girder_websocket::{Connection, WebSocketHandler, WebSocketServer};
//! use async_trait::async_trait;
//! use futures::StreamExt;
//!
//! struct ChatHandler;
//!
//! #[async_trait]
//! impl WebSocketHandler for ChatHandler {
//!     async fn handle(&self, connection: &Connection) {
//!         let mut incoming = connection.read();
//!         while let Some(message) = incoming.next().await {
//!             if let Some(text) = message.as_text() {
//!                 let _ = connection.write_text(format!("you said: {text}")).await;
//!             }
//!         }
//!     }
//! }
//!
//! # async fn run() -> girder_websocket::WebSocketResult<()> {
//! let server = WebSocketServer::builder()
//!     .subprotocols(["chat"])
//!     .read_limit(64 * 1024)
//!     .build(ChatHandler)?;
//! server.listen("127.0.0.1:9001").await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod close;
mod connection;
mod context;
mod deflate;
mod error;
mod frame;
mod handler;
mod handshake;
mod message;
mod options;
mod registry;
mod server;
mod transport;
mod upgrade;

pub use close::{CloseCause, CloseCode, CloseFrame, MAX_CLOSE_REASON_LEN};
pub use connection::{
    Connection, ConnectionHandle, ConnectionId, ConnectionState, ReceiveStream,
};
pub use context::ConnectionContext;
pub use deflate::{DeflateConfig, PERMESSAGE_DEFLATE};
pub use error::{WebSocketError, WebSocketResult};
pub use handler::{EchoHandler, PanicSink, TracingPanicSink, WebSocketHandler};
pub use handshake::{WEBSOCKET_VERSION, is_upgrade_request, upgrade_required};
pub use message::{Message, MessageType, PreparedMessage};
pub use options::{
    DEFAULT_BUFFER_SIZE, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_READ_INTERVAL, DEFAULT_READ_LIMIT,
    DEFAULT_WRITE_INTERVAL, Options,
};
pub use server::{Fallback, Served, ShutdownMode, WebSocketServer, WebSocketServerBuilder};
pub use upgrade::{HyperUpgrade, MAX_REQUEST_HEAD, RawUpgrade, TcpUpgrade};

// Re-export the tungstenite message type for conversions
pub use tungstenite::Message as RawMessage;
