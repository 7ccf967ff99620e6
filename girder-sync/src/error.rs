//! Error types for the concurrency primitives.

use thiserror::Error;

/// Error returned by [`Pool::use_item`](crate::Pool::use_item).
#[derive(Error, Debug)]
pub enum PoolError<E> {
    /// The pool was closed before the call started.
    #[error("Pool is closed")]
    Closed,

    /// The borrowed operation panicked; the item was discarded.
    #[error("Pooled operation panicked: {0}")]
    Panicked(String),

    /// Creating an item or the borrowed operation failed.
    #[error("{0}")]
    Failed(E),
}

impl<E> PoolError<E> {
    /// Return the inner error of a [`PoolError::Failed`].
    pub fn into_failed(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
