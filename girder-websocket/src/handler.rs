//! WebSocket handler trait and the task that runs it.

use crate::close::CloseFrame;
use crate::connection::Connection;
use crate::error::WebSocketError;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Application logic for one connection.
///
/// `handle` runs once per accepted connection in its own task. When it
/// returns, the connection is closed with 1000; when it panics, with 1011,
/// and the panic is reported to the server's [`PanicSink`]. The connection
/// is only borrowed for the duration of the call.
#[async_trait]
pub trait WebSocketHandler: Send + Sync + 'static {
    /// Drive the application protocol over `connection`.
    async fn handle(&self, connection: &Connection);
}

#[async_trait]
impl<H: WebSocketHandler + ?Sized> WebSocketHandler for Arc<H> {
    async fn handle(&self, connection: &Connection) {
        (**self).handle(connection).await
    }
}

/// Writes every received message back unchanged.
#[derive(Debug, Default, Clone)]
pub struct EchoHandler;

#[async_trait]
impl WebSocketHandler for EchoHandler {
    async fn handle(&self, connection: &Connection) {
        let mut incoming = connection.read();
        while let Some(message) = incoming.next().await {
            tracing::trace!(
                connection_id = %connection.id(),
                message_type = ?message.message_type,
                payload_len = message.len(),
                "Echoing message"
            );
            if let Err(e) = connection.write(message).await {
                tracing::debug!(connection_id = %connection.id(), error = %e, "Echo write failed");
                break;
            }
        }
    }
}

/// Receives reports of handler panics.
pub trait PanicSink: Send + Sync + 'static {
    /// Called once per panicking handler with the panic message.
    fn report(&self, connection_id: &str, message: &str);
}

impl<F> PanicSink for F
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    fn report(&self, connection_id: &str, message: &str) {
        self(connection_id, message)
    }
}

/// Default sink: an `error!` event. The process panic hook has already
/// printed the location and, with `RUST_BACKTRACE` set, the backtrace.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPanicSink;

impl PanicSink for TracingPanicSink {
    fn report(&self, connection_id: &str, message: &str) {
        tracing::error!(connection_id = %connection_id, panic = %message, "WebSocket handler panicked");
    }
}

/// Run the handler and close the connection after it.
///
/// This is the only place handler panics are caught.
pub(crate) async fn run_handler<H>(
    handler: Arc<H>,
    connection: Connection,
    sink: Arc<dyn PanicSink>,
) where
    H: WebSocketHandler,
{
    let outcome = AssertUnwindSafe(handler.handle(&connection))
        .catch_unwind()
        .await;

    match outcome {
        Ok(()) => {
            if let Err(e) = connection.shutdown_with(CloseFrame::normal()).await {
                tracing::debug!(connection_id = %connection.id(), error = %e, "Close after handler failed");
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            sink.report(connection.id(), &message);
            let error = WebSocketError::HandlerPanic(message);
            connection.shared.fail(error.close_frame(), error);
        }
    }

    connection.shared.task_exited();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_closure_panic_sink() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink: Arc<dyn PanicSink> = {
            let reports = Arc::clone(&reports);
            Arc::new(move |id: &str, message: &str| {
                reports.lock().push(format!("{id}: {message}"));
            })
        };

        sink.report("conn-1", "boom");
        assert_eq!(*reports.lock(), vec!["conn-1: boom".to_string()]);
    }
}
