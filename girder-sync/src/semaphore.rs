//! Counting semaphore with explicit lock/unlock.
//!
//! Unlike [`tokio::sync::Semaphore`], permits are not tied to a guard
//! value: a permit taken with [`Semaphore::lock`] stays held until some
//! caller invokes [`Semaphore::unlock`]. [`Semaphore::acquire`] offers the
//! guard-based form for callers that want it.
//!
//! A capacity of zero builds an unbounded semaphore on which every
//! operation succeeds immediately. Higher layers use it as the
//! "no limit" sentinel.
//!
//! ## Example
//!
//! ```rust
//! use girder_sync::Semaphore;
//!
//! # tokio_test::block_on(async {
//! let sem = Semaphore::new(2);
//!
//! sem.lock().await;
//! assert!(sem.try_lock());
//! assert!(!sem.try_lock());
//!
//! sem.unlock();
//! assert_eq!(sem.len(), 1);
//! # });
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    capacity: usize,
    permits: Option<tokio::sync::Semaphore>,
    held: AtomicUsize,
}

impl Semaphore {
    /// Create a semaphore with `capacity` permits.
    ///
    /// A capacity of zero creates an unbounded semaphore.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: (capacity > 0).then(|| tokio::sync::Semaphore::new(capacity)),
            held: AtomicUsize::new(0),
        }
    }

    /// Create an unbounded semaphore.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Configured capacity; zero means unbounded.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this semaphore never blocks.
    pub fn is_unbounded(&self) -> bool {
        self.permits.is_none()
    }

    /// Acquire one permit, waiting until one is available.
    pub async fn lock(&self) {
        let Some(permits) = &self.permits else {
            return;
        };

        // The inner semaphore is never closed, so acquisition only ends in success.
        if let Ok(permit) = permits.acquire().await {
            permit.forget();
            self.held.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Try to acquire one permit without waiting.
    ///
    /// Returns `true` iff a permit was acquired.
    pub fn try_lock(&self) -> bool {
        let Some(permits) = &self.permits else {
            return true;
        };

        match permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.held.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Release one permit.
    ///
    /// # Panics
    ///
    /// Panics if no permit is currently held.
    pub fn unlock(&self) {
        let Some(permits) = &self.permits else {
            return;
        };

        let released = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1));
        if released.is_err() {
            panic!("Semaphore::unlock called without a matching lock");
        }
        permits.add_permits(1);
    }

    /// Number of permits currently held.
    ///
    /// Always zero for an unbounded semaphore.
    pub fn len(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Whether no permit is currently held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire a permit that is released when the guard drops.
    pub async fn acquire(&self) -> SemaphoreGuard<'_> {
        self.lock().await;
        SemaphoreGuard { semaphore: self }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Releases its permit on drop.
#[derive(Debug)]
#[must_use = "the permit is released as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let sem = Semaphore::new(2);
        sem.lock().await;
        sem.lock().await;
        assert_eq!(sem.len(), 2);
        assert!(!sem.try_lock());

        sem.unlock();
        assert_eq!(sem.len(), 1);
        assert!(sem.try_lock());
        assert_eq!(sem.len(), 2);
    }

    #[test]
    fn test_zero_capacity_never_blocks() {
        let sem = Semaphore::new(0);
        assert!(sem.is_unbounded());
        for _ in 0..1000 {
            assert!(sem.try_lock());
        }
        sem.unlock();
        assert_eq!(sem.len(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_lock_returns_immediately() {
        let sem = Semaphore::new(0);
        tokio::time::timeout(Duration::from_millis(50), async {
            for _ in 0..100 {
                sem.lock().await;
            }
        })
        .await
        .expect("unbounded lock should not wait");
    }

    #[test]
    #[should_panic(expected = "without a matching lock")]
    fn test_unlock_without_lock_panics() {
        let sem = Semaphore::new(1);
        sem.unlock();
    }

    #[tokio::test]
    async fn test_lock_waits_for_unlock() {
        let sem = Arc::new(Semaphore::new(1));
        sem.lock().await;

        let waiter = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                sem.lock().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        sem.unlock();
        waiter.await.unwrap();
        assert_eq!(sem.len(), 1);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let sem = Semaphore::new(1);
        {
            let _guard = sem.acquire().await;
            assert_eq!(sem.len(), 1);
        }
        assert!(sem.is_empty());
    }

    #[tokio::test]
    async fn test_held_permits_stay_within_capacity() {
        let sem = Arc::new(Semaphore::new(3));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..32 {
            let sem = Arc::clone(&sem);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                sem.lock().await;
                let held = sem.len();
                peak.fetch_max(held, Ordering::SeqCst);
                assert!(held <= 3);
                tokio::task::yield_now().await;
                sem.unlock();
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(sem.is_empty());
    }
}
