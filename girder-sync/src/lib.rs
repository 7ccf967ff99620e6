//! # Girder Sync
//!
//! Concurrency primitives used alongside the Girder WebSocket server.
//!
//! ## Features
//!
//! - [`Semaphore`]: counting semaphore with explicit lock/unlock and a
//!   non-blocking `try_lock`; capacity zero means unbounded
//! - [`Pool`]: bounded pool of lazily created items, with items that
//!   fail or panic discarded instead of reused
//! - [`schedule`]: run a known number of jobs under a concurrency limit,
//!   starting them in id order, either fail-fast or forced
//!
//! ## Example
//!
//! ```rust
//! use girder_sync::{Pool, ScheduleOptions, schedule};
//!
//! # async fn example() -> Result<(), String> {
//! let pool: Pool<String, String> = Pool::new(2, || Ok(String::new()), |_| {});
//!
//! schedule(8, ScheduleOptions::limit(2), |id| {
//!     let pool = &pool;
//!     async move {
//!         pool.use_item(|buf| {
//!             Box::pin(async move {
//!                 buf.clear();
//!                 buf.push_str(&format!("job-{id}"));
//!                 Ok(())
//!             })
//!         })
//!         .await
//!         .map_err(|e| e.to_string())
//!     }
//! })
//! .await?;
//!
//! pool.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod error;
mod pool;
mod schedule;
mod semaphore;

pub use error::PoolError;
pub use pool::Pool;
pub use schedule::{ScheduleOptions, schedule};
pub use semaphore::{Semaphore, SemaphoreGuard};
