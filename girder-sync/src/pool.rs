//! Bounded pool of lazily created, reusable items.
//!
//! At most `limit` items exist at any time, counting both idle items and
//! items borrowed by a running [`Pool::use_item`]. Items are created on
//! demand by the `create` callback and leave the pool through the
//! `discard` callback, which runs exactly once per item: when a borrow
//! fails, panics or is dropped before finishing, when an item comes back
//! after [`Pool::close`], or when `close` drains the idle set.
//!
//! ## Example
//!
//! ```rust
//! use girder_sync::Pool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool: Pool<Vec<u8>, std::io::Error> = Pool::new(
//!     4,
//!     || Ok(Vec::with_capacity(1024)),
//!     |buf| drop(buf),
//! );
//!
//! let len = pool
//!     .use_item(|buf| {
//!         Box::pin(async move {
//!             buf.clear();
//!             buf.extend_from_slice(b"payload");
//!             Ok(buf.len())
//!         })
//!     })
//!     .await?;
//! assert_eq!(len, 7);
//!
//! pool.close();
//! # Ok(())
//! # }
//! ```

use crate::error::{PoolError, panic_message};
use crate::semaphore::Semaphore;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;

type CreateFn<T, E> = Box<dyn Fn() -> Result<T, E> + Send + Sync>;
type DiscardFn<T> = Box<dyn Fn(T) + Send + Sync>;

struct PoolState<T> {
    idle: Vec<T>,
    closed: bool,
}

/// Bounded pool of reusable items.
pub struct Pool<T, E> {
    limit: usize,
    permits: Semaphore,
    state: Mutex<PoolState<T>>,
    create: CreateFn<T, E>,
    discard: DiscardFn<T>,
}

impl<T, E> Pool<T, E>
where
    T: Send,
{
    /// Create a pool holding at most `limit` items.
    ///
    /// A limit of zero places no bound on the number of items.
    pub fn new<C, D>(limit: usize, create: C, discard: D) -> Self
    where
        C: Fn() -> Result<T, E> + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self {
            limit,
            permits: Semaphore::new(limit),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                closed: false,
            }),
            create: Box::new(create),
            discard: Box::new(discard),
        }
    }

    /// Maximum number of items; zero means unbounded.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of idle items ready for reuse.
    pub fn idle_len(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of items currently borrowed.
    pub fn in_use(&self) -> usize {
        self.permits.len()
    }

    /// Whether [`Pool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Borrow an item and run `f` with it.
    ///
    /// Reuses an idle item when one exists, otherwise creates one, and
    /// waits when the limit is reached. If `f` fails or panics the item
    /// is discarded instead of returned; a panic is reported as
    /// [`PoolError::Panicked`] and does not propagate.
    pub async fn use_item<R, F>(&self, f: F) -> Result<R, PoolError<E>>
    where
        F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<R, E>>,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let _permit = self.permits.acquire().await;

        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.idle.pop()
        };

        let item = match idle {
            Some(item) => item,
            None => (self.create)().map_err(PoolError::Failed)?,
        };

        // Declared after the permit so the item is settled before the
        // permit is released.
        let mut borrowed = Borrowed {
            pool: self,
            item: Some(item),
        };
        let Some(item) = borrowed.item.as_mut() else {
            unreachable!("borrowed item is present until settled");
        };

        let outcome = AssertUnwindSafe(f(item)).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => {
                borrowed.release();
                Ok(value)
            }
            Ok(Err(e)) => Err(PoolError::Failed(e)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(panic = %message, "Pooled operation panicked, discarding item");
                Err(PoolError::Panicked(message))
            }
        }
    }

    /// Discard every idle item and stop reusing items.
    ///
    /// Borrows in progress are not interrupted; their items are discarded
    /// when they come back.
    ///
    /// # Panics
    ///
    /// Panics if the pool is already closed.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                panic!("Pool::close called twice");
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };

        tracing::debug!(discarded = idle.len(), "Pool closed");
        for item in idle {
            (self.discard)(item);
        }
    }

    fn release(&self, item: T) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            (self.discard)(item);
        } else {
            state.idle.push(item);
        }
    }
}

/// An item lent out by [`Pool::use_item`].
///
/// Unless released back to the pool, the item is discarded on drop. This
/// covers failed and panicking borrows as well as a `use_item` future
/// dropped mid-borrow.
struct Borrowed<'p, T, E> {
    pool: &'p Pool<T, E>,
    item: Option<T>,
}

impl<T: Send, E> Borrowed<'_, T, E> {
    fn release(mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

impl<T, E> Drop for Borrowed<'_, T, E> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            tracing::trace!("Discarding borrowed item");
            (self.pool.discard)(item);
        }
    }
}

impl<T, E> std::fmt::Debug for Pool<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pool")
            .field("limit", &self.limit)
            .field("idle", &state.idle.len())
            .field("in_use", &self.permits.len())
            .field("closed", &state.closed)
            .finish()
    }
}
