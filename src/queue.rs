//! FIFO job queue with a runtime-adjustable concurrency limit.
//!
//! Admission is a fair [`Semaphore`]: waiters are served oldest first and a
//! [`QueueSlot`] wraps the owned permit, releasing it on drop.
//!
//! The limit can change while jobs run:
//!
//! - Raising it adds permits, so waiters are admitted at once.
//! - Lowering it forgets idle permits. Permits still held by running jobs
//!   cannot be taken back, so the shortfall is recorded as debt and paid by
//!   forgetting permits as those jobs finish.
//!
//! ```ignore
//! let queue = JobQueue::new(2);
//! let output = queue.run(async { expensive().await }).await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Limit used when none is configured.
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug)]
struct Limits {
    limit: usize,
    /// Permits still to be forgotten when running jobs finish.
    debt: usize,
}

#[derive(Debug)]
struct Shared {
    semaphore: Arc<Semaphore>,
    limits: Mutex<Limits>,
    active: AtomicUsize,
    pending: AtomicUsize,
    peak: AtomicUsize,
}

impl Shared {
    fn limits(&self) -> MutexGuard<'_, Limits> {
        self.limits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission to run one job. Released on drop.
#[derive(Debug)]
pub struct QueueSlot {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        {
            let mut limits = self.shared.limits();
            if let Some(permit) = self.permit.take() {
                if limits.debt > 0 {
                    limits.debt -= 1;
                    permit.forget();
                } else {
                    drop(permit);
                }
            }
        }
        self.shared.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counts a waiter for as long as it waits, including when it gives up.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn new(pending: &'a AtomicUsize) -> Self {
        pending.fetch_add(1, Ordering::Relaxed);
        Self(pending)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded-parallelism FIFO scheduler.
#[derive(Debug, Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl JobQueue {
    /// Create a queue admitting at most `limit` jobs at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(limit)),
                limits: Mutex::new(Limits { limit, debt: 0 }),
                active: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.shared.limits().limit
    }

    /// Change the limit. Running jobs are never interrupted.
    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let mut limits = self.shared.limits();
        if limits.limit == limit {
            return;
        }
        debug!(from = limits.limit, to = limit, "job queue limit changed");

        if limit > limits.limit {
            let raise = limit - limits.limit;
            let paid = raise.min(limits.debt);
            limits.debt -= paid;
            self.shared.semaphore.add_permits(raise - paid);
        } else {
            let cut = limits.limit - limit;
            let forgotten = self.shared.semaphore.forget_permits(cut);
            limits.debt += cut - forgotten;
        }
        limits.limit = limit;
    }

    /// Jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Jobs waiting for a slot.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneously active jobs seen so far.
    pub fn peak(&self) -> usize {
        self.shared.peak.load(Ordering::Relaxed)
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> QueueSlot {
        let semaphore = Arc::clone(&self.shared.semaphore);
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                let _waiting = Waiting::new(&self.shared.pending);
                debug!(
                    active = self.active(),
                    pending = self.pending(),
                    "job queued"
                );
                // The semaphore is never closed.
                semaphore.acquire_owned().await.ok()
            }
        };

        let active = self.shared.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.peak.fetch_max(active, Ordering::Relaxed);
        QueueSlot {
            permit,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run `job` once a slot is free, holding the slot until it completes.
    pub async fn run<F: Future>(&self, job: F) -> F::Output {
        let _slot = self.acquire().await;
        job.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_within_limit_is_immediate() {
        let queue = JobQueue::new(2);
        let a = queue.acquire().await;
        let b = queue.acquire().await;
        assert_eq!(queue.active(), 2);
        drop(a);
        drop(b);
        assert_eq!(queue.active(), 0);
    }

    #[tokio::test]
    async fn waiter_admitted_when_slot_released() {
        let queue = JobQueue::new(1);
        let first = queue.acquire().await;

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.run(async { 7 }).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), 1);

        drop(first);
        assert_eq!(waiter.await.unwrap(), 7);
        assert_eq!(queue.active(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let queue = JobQueue::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..12)
            .map(|_| {
                let queue = queue.clone();
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    queue
                        .run(async {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();
        for job in jobs {
            job.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(queue.peak() <= 3);
        assert_eq!(queue.active(), 0);
    }

    #[tokio::test]
    async fn raising_limit_admits_waiters() {
        let queue = JobQueue::new(1);
        let held = queue.acquire().await;

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), 1);

        queue.set_limit(2);
        let slot = waiter.await.unwrap();
        assert_eq!(queue.active(), 2);
        drop(slot);
        drop(held);
    }

    #[tokio::test]
    async fn lowering_limit_keeps_running_jobs() {
        let queue = JobQueue::new(3);
        let a = queue.acquire().await;
        let b = queue.acquire().await;
        queue.set_limit(1);
        assert_eq!(queue.active(), 2);

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // still one running, limit is one
        assert_eq!(queue.pending(), 1);

        drop(b);
        let slot = waiter.await.unwrap();
        assert_eq!(queue.active(), 1);
        drop(slot);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_slot() {
        let queue = JobQueue::new(1);
        let held = queue.acquire().await;

        let q = queue.clone();
        let abandoned = tokio::spawn(async move { q.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(held);
        assert_eq!(queue.active(), 0);
        let again = queue.acquire().await;
        assert_eq!(queue.active(), 1);
        drop(again);
    }

    #[tokio::test]
    async fn raising_after_lowering_pays_debt_first() {
        let queue = JobQueue::new(2);
        let a = queue.acquire().await;
        let b = queue.acquire().await;
        queue.set_limit(1);
        queue.set_limit(2);

        drop(a);
        let c = queue.acquire().await;
        assert_eq!(queue.active(), 2);

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), 1);

        drop(b);
        drop(waiter.await.unwrap());
        drop(c);
        assert_eq!(queue.active(), 0);
        assert_eq!(queue.shared.semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn lowered_limit_settles_once_jobs_finish() {
        let queue = JobQueue::new(4);
        let slots = vec![
            queue.acquire().await,
            queue.acquire().await,
            queue.acquire().await,
        ];
        queue.set_limit(2);
        drop(slots);
        assert_eq!(queue.active(), 0);
        assert_eq!(queue.shared.semaphore.available_permits(), 2);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let queue = JobQueue::new(0);
        assert_eq!(queue.limit(), 1);
        queue.set_limit(0);
        assert_eq!(queue.limit(), 1);
    }

    #[test]
    fn default_limit() {
        assert_eq!(JobQueue::default().limit(), DEFAULT_CONCURRENCY);
    }
}
