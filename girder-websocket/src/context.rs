//! Per-connection cancellation signal carrying the close cause.

use crate::close::CloseCause;
use tokio::sync::watch;

/// Cancellation handle of a connection.
///
/// Cancelled exactly once, with the [`CloseCause`] describing how the
/// connection ended. Peer-initiated and abnormal closures cancel it right
/// away; a locally initiated close cancels it once the close handshake
/// completes or times out.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    cause: watch::Receiver<Option<CloseCause>>,
}

impl ConnectionContext {
    pub(crate) fn new(cause: watch::Receiver<Option<CloseCause>>) -> Self {
        Self { cause }
    }

    /// Whether the connection has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cause.borrow().is_some()
    }

    /// The close cause, once cancelled.
    pub fn cause(&self) -> Option<CloseCause> {
        self.cause.borrow().clone()
    }

    /// Wait for cancellation and return the cause.
    pub async fn cancelled(&self) -> CloseCause {
        let mut cause = self.cause.clone();
        match cause.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone().unwrap_or_else(|| CloseCause::abnormal(None)),
            // The connection was dropped without recording a cause.
            Err(_) => CloseCause::abnormal(None),
        }
    }
}

/// Sending side, owned by the connection.
#[derive(Debug)]
pub(crate) struct CancelSource {
    cause: watch::Sender<Option<CloseCause>>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (cause, _) = watch::channel(None);
        Self { cause }
    }

    pub fn context(&self) -> ConnectionContext {
        ConnectionContext::new(self.cause.subscribe())
    }

    /// Record `cause` unless one is already set. Returns whether it was recorded.
    pub fn cancel(&self, cause: CloseCause) -> bool {
        let mut cause = Some(cause);
        self.cause.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = cause.take();
            true
        })
    }

    pub fn cause(&self) -> Option<CloseCause> {
        self.cause.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::{CloseCode, CloseFrame};
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_cause_wins() {
        let source = CancelSource::new();
        let context = source.context();
        assert!(!context.is_cancelled());

        assert!(source.cancel(CloseCause::clean(CloseFrame::normal())));
        assert!(!source.cancel(CloseCause::abnormal(None)));

        assert!(context.is_cancelled());
        assert_eq!(context.cancelled().await.code(), CloseCode::NORMAL);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let source = CancelSource::new();
        let context = source.context();

        let waiter = tokio::spawn(async move { context.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel(CloseCause::clean(CloseFrame::going_away()));

        let cause = waiter.await.unwrap();
        assert_eq!(cause.code(), CloseCode::GOING_AWAY);
        assert!(cause.was_clean);
    }

    #[tokio::test]
    async fn test_dropped_source_reads_as_abnormal() {
        let context = CancelSource::new().context();
        let cause = context.cancelled().await;
        assert_eq!(cause.code(), CloseCode::ABNORMAL);
        assert!(!cause.was_clean);
    }
}
