//! Ordered scheduling of a fixed number of jobs under a concurrency limit.
//!
//! [`schedule`] runs `worker(i)` for every `i` in `0..count`. Jobs are
//! dispatched one at a time in increasing id order through a
//! [`Semaphore`], so they *start* in order; with more than one job in
//! flight nothing is promised about how their bodies interleave or the
//! order in which they finish.
//!
//! ## Example
//!
//! ```rust
//! use girder_sync::{ScheduleOptions, schedule};
//!
//! # async fn example() {
//! let result = schedule(10, ScheduleOptions::limit(4), |id| async move {
//!     if id == 7 { Err(format!("job {id} failed")) } else { Ok(()) }
//! })
//! .await;
//!
//! assert_eq!(result, Err("job 7 failed".to_string()));
//! # }
//! ```

use crate::semaphore::Semaphore;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;

/// Options for [`schedule`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Maximum number of jobs in flight; zero or negative means unlimited.
    pub limit: i64,
    /// Keep dispatching after a job fails.
    pub force: bool,
}

impl ScheduleOptions {
    /// Fail-fast options with the given concurrency limit.
    pub fn limit(limit: i64) -> Self {
        Self {
            limit,
            force: false,
        }
    }

    /// Dispatch every job even after a failure.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    fn capacity(&self) -> usize {
        usize::try_from(self.limit.max(0)).unwrap_or(usize::MAX)
    }
}

/// Run `worker(i)` for every `i` in `0..count`.
///
/// Returns the first error any job produced. Without
/// [`ScheduleOptions::force`], no further job is dispatched once a failure
/// has been observed; jobs already in flight run to completion. With it,
/// every job is dispatched regardless of earlier failures.
///
/// A `count` of zero or less returns `Ok(())` without calling `worker`.
pub async fn schedule<F, Fut, E>(count: i64, options: ScheduleOptions, worker: F) -> Result<(), E>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let Ok(count) = usize::try_from(count) else {
        return Ok(());
    };
    if count == 0 {
        return Ok(());
    }

    let semaphore = Semaphore::new(options.capacity());
    let worker = &worker;
    let semaphore_ref = &semaphore;
    let mut in_flight = FuturesUnordered::new();
    let mut first_error: Option<E> = None;
    let mut next = 0;

    while next < count {
        if !options.force && first_error.is_some() {
            tracing::debug!(dispatched = next, count, "Schedule stopped after failure");
            break;
        }

        tokio::select! {
            biased;

            Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                record(&mut first_error, result);
            }
            _ = semaphore_ref.lock() => {
                let id = next;
                next += 1;
                in_flight.push(async move {
                    let result = worker(id).await;
                    semaphore_ref.unlock();
                    result
                });
            }
        }
    }

    while let Some(result) = in_flight.next().await {
        record(&mut first_error, result);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn record<E>(first_error: &mut Option<E>, result: Result<(), E>) {
    if let Err(e) = result
        && first_error.is_none()
    {
        *first_error = Some(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_zero_count_skips_worker() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), ()> = schedule(0, ScheduleOptions::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let negative: Result<(), ()> =
            schedule(-3, ScheduleOptions::default(), |_| async { Ok(()) }).await;
        assert!(negative.is_ok());
    }

    #[tokio::test]
    async fn test_every_job_runs_once() {
        let seen = Mutex::new(Vec::new());
        let result: Result<(), ()> = schedule(50, ScheduleOptions::limit(4), |id| {
            seen.lock().push(id);
            async { Ok(()) }
        })
        .await;

        assert!(result.is_ok());
        let seen = seen.into_inner();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_limit_caps_in_flight_jobs() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let result: Result<(), ()> = schedule(20, ScheduleOptions::limit(3), |_| {
            let active = &active;
            let peak = &peak;
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_dispatch() {
        let started = Mutex::new(BTreeSet::new());

        let result = schedule(100, ScheduleOptions::limit(1), |id| {
            started.lock().insert(id);
            async move { if id == 5 { Err(id) } else { Ok(()) } }
        })
        .await;

        assert_eq!(result, Err(5));
        let started = started.into_inner();
        assert_eq!(started, (0..=5).collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn test_force_runs_everything_and_keeps_first_error() {
        let started = AtomicUsize::new(0);

        let result = schedule(30, ScheduleOptions::limit(2).force(), |id| {
            started.fetch_add(1, Ordering::SeqCst);
            async move {
                if id % 10 == 3 {
                    tokio::time::sleep(Duration::from_millis(u64::try_from(id).unwrap())).await;
                    Err(id)
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(started.load(Ordering::SeqCst), 30);
        assert_eq!(result, Err(3));
    }

    #[tokio::test]
    async fn test_unlimited_runs_all_concurrently() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let result: Result<(), ()> = schedule(16, ScheduleOptions::limit(0), |_| {
            let active = &active;
            let peak = &peak;
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 16);
    }
}
