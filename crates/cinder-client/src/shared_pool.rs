//! Shared resource pool with per-resource backoff.
//!
//! Unlike a classic connection pool, resources are not checked out
//! exclusively: any number of callers may hold the same resource at once.
//! The pool only decides which resource a caller should use next, spreading
//! load across resources and keeping failed ones out of rotation until their
//! backoff window elapses.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::backoff::BackoffStrategy;

/// Errors from misuse of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("attempted to pull from an empty pool")]
    Empty,

    #[error("resource is not part of this pool")]
    UnknownResource,
}

/// When a record was last handed out.
///
/// Fresh records sort before any chosen record and among themselves by
/// insertion position, so new resources are handed out in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LastChosen {
    Never(usize),
    At(Instant),
}

struct Record<T> {
    resource: T,
    last_chosen: LastChosen,
    /// End of the backoff window. `None` means available now.
    available_after: Option<Instant>,
    backoff: Arc<dyn BackoffStrategy>,
}

impl<T> Record<T> {
    fn is_available(&self, now: Instant) -> bool {
        self.available_after.is_none_or(|after| after <= now)
    }
}

/// Pool of shared resources, each with its own backoff state.
pub struct SharedPool<T> {
    strategy: Arc<dyn BackoffStrategy>,
    records: Mutex<Vec<Record<T>>>,
    contention: AtomicUsize,
}

/// Decrements the contention counter when a waiting `pull` finishes or is
/// dropped.
struct ContentionGuard<'a>(&'a AtomicUsize);

impl<'a> ContentionGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ContentionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Clone + PartialEq> SharedPool<T> {
    /// Creates an empty pool whose resources start from `strategy`.
    pub fn new(strategy: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            strategy,
            records: Mutex::new(Vec::new()),
            contention: AtomicUsize::new(0),
        }
    }

    /// Inserts a resource and makes it immediately available.
    pub fn add(&self, resource: T) {
        let mut records = self.records.lock();
        let position = records.len();
        records.push(Record {
            resource,
            last_chosen: LastChosen::Never(position),
            available_after: None,
            backoff: self.strategy.clone(),
        });
    }

    /// Returns the least recently chosen available resource.
    ///
    /// Ties are broken uniformly at random. When every resource is backing
    /// off, waits until the earliest backoff window elapses and tries again.
    pub async fn pull(&self) -> Result<T, PoolError> {
        loop {
            let wake_at = {
                let mut records = self.records.lock();
                if records.is_empty() {
                    return Err(PoolError::Empty);
                }

                let now = Instant::now();
                if let Some(index) = choose_least_recent(&records, now) {
                    let record = &mut records[index];
                    record.last_chosen = LastChosen::At(now);
                    return Ok(record.resource.clone());
                }

                records.iter().filter_map(|r| r.available_after).min().unwrap_or(now)
            };

            let _guard = ContentionGuard::enter(&self.contention);
            debug!(
                wait_ms = wake_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "every pooled resource is backing off, waiting"
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Marks a failed request against `resource`, starting a backoff window.
    ///
    /// When several callers fail the same resource at once only the first
    /// failure counts: failing a resource already inside its window is a
    /// no-op.
    pub fn fail(&self, resource: &T) -> Result<(), PoolError> {
        let mut records = self.records.lock();
        let record = find_record(&mut records, resource)?;
        let now = Instant::now();
        if !record.is_available(now) {
            return Ok(());
        }

        let delay = record.backoff.delay();
        record.available_after = Some(now + delay);
        record.backoff = record.backoff.next();
        debug!(delay_ms = delay.as_millis() as u64, "pooled resource failed, backing off");
        Ok(())
    }

    /// Marks a successful request, clearing any backoff on `resource`.
    pub fn succeed(&self, resource: &T) -> Result<(), PoolError> {
        let mut records = self.records.lock();
        let record = find_record(&mut records, resource)?;
        record.backoff = self.strategy.clone();
        record.available_after = None;
        Ok(())
    }

    /// Number of callers currently waiting inside [`SharedPool::pull`].
    pub fn contention(&self) -> usize {
        self.contention.load(Ordering::SeqCst)
    }

    /// Resources whose backoff window has elapsed at `now`.
    pub fn available_at(&self, now: Instant) -> Vec<T> {
        self.records.lock().iter().filter(|r| r.is_available(now)).map(|r| r.resource.clone()).collect()
    }

    /// Resources still inside their backoff window at `now`.
    pub fn unavailable_at(&self, now: Instant) -> Vec<T> {
        self.records.lock().iter().filter(|r| !r.is_available(now)).map(|r| r.resource.clone()).collect()
    }

    pub fn available(&self) -> Vec<T> {
        self.available_at(Instant::now())
    }

    pub fn unavailable(&self) -> Vec<T> {
        self.unavailable_at(Instant::now())
    }

    /// Every resource in the pool, in insertion order.
    pub fn all(&self) -> Vec<T> {
        self.records.lock().iter().map(|r| r.resource.clone()).collect()
    }

    /// End of the backoff window of `resource`, if it is backing off.
    pub fn backoff_until(&self, resource: &T) -> Result<Option<Instant>, PoolError> {
        let mut records = self.records.lock();
        Ok(find_record(&mut records, resource)?.available_after)
    }
}

fn find_record<'a, T: PartialEq>(records: &'a mut [Record<T>], resource: &T) -> Result<&'a mut Record<T>, PoolError> {
    records.iter_mut().find(|r| &r.resource == resource).ok_or(PoolError::UnknownResource)
}

fn choose_least_recent<T>(records: &[Record<T>], now: Instant) -> Option<usize> {
    let oldest = records.iter().filter(|r| r.is_available(now)).map(|r| r.last_chosen).min()?;
    let ties: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_available(now) && r.last_chosen == oldest)
        .map(|(index, _)| index)
        .collect();
    ties.choose(&mut rand::rng()).copied()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::ExponentialBackoff;

    fn test_pool() -> SharedPool<u32> {
        let pool = SharedPool::new(Arc::new(ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_millis(5000),
            0,
        )));
        pool.add(0);
        pool.add(1);
        pool.add(2);
        pool
    }

    async fn pull_three(pool: &SharedPool<u32>) -> Vec<u32> {
        let mut output = Vec::new();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(1)).await;
            output.push(pool.pull().await.unwrap());
        }
        output
    }

    // ========================================================================
    // Selection
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_hands_out_fresh_resources_in_insertion_order() {
        let pool = test_pool();
        assert_eq!(pull_three(&pool).await, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excludes_failed_resources() {
        let pool = test_pool();
        pool.fail(&0).unwrap();
        assert_eq!(pull_three(&pool).await, vec![1, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_are_broken_among_equally_old_resources() {
        let pool = test_pool();
        // Pull without advancing time: every resource ends up chosen at the
        // same instant, so the next pick is a tie between all three.
        for _ in 0..3 {
            pool.pull().await.unwrap();
        }
        let picked = pool.pull().await.unwrap();
        assert!([0, 1, 2].contains(&picked));
    }

    #[tokio::test]
    async fn test_empty_pool_errors_immediately() {
        let pool: SharedPool<u32> = SharedPool::new(crate::backoff::default_strategy());
        assert_eq!(pool.pull().await, Err(PoolError::Empty));
        assert_eq!(pool.fail(&7), Err(PoolError::UnknownResource));
    }

    // ========================================================================
    // Backoff
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_adds_resources_back_and_keeps_backing_off() {
        let pool = test_pool();
        pool.fail(&0).unwrap();
        assert_eq!(pull_three(&pool).await, vec![1, 2, 1]);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(pull_three(&pool).await, vec![0, 2, 1]);
        pool.fail(&0).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(pull_three(&pool).await, vec![2, 1, 2]);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(pull_three(&pool).await, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let pool = test_pool();
        pool.fail(&0).unwrap();
        assert_eq!(pull_three(&pool).await, vec![1, 2, 1]);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(pull_three(&pool).await, vec![0, 2, 1]);
        pool.succeed(&0).unwrap();
        pool.fail(&0).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(pull_three(&pool).await, vec![0, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_back_off_once() {
        let pool = test_pool();
        let resource = pool.pull().await.unwrap();
        pool.fail(&resource).unwrap();
        let expected = Some(Instant::now() + Duration::from_millis(500));
        assert_eq!(pool.backoff_until(&resource).unwrap(), expected);
        pool.fail(&resource).unwrap();
        assert_eq!(pool.backoff_until(&resource).unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_and_unavailable_are_complements() {
        let pool = test_pool();
        pool.fail(&1).unwrap();
        assert_eq!(pool.available(), vec![0, 2]);
        assert_eq!(pool.unavailable(), vec![1]);
        let later = Instant::now() + Duration::from_millis(500);
        assert_eq!(pool.available_at(later), vec![0, 1, 2]);
        assert!(pool.unavailable_at(later).is_empty());
        assert_eq!(pool.all(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_waits_for_earliest_window() {
        let pool = Arc::new(test_pool());
        pool.fail(&0).unwrap();
        pool.fail(&1).unwrap();
        pool.fail(&2).unwrap();
        pool.fail(&2).unwrap();

        let started = Instant::now();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.pull().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.contention(), 1);

        let resource = waiter.await.unwrap().unwrap();
        assert_eq!(resource, 0);
        assert!(Instant::now() - started >= Duration::from_millis(500));
        assert_eq!(pool.contention(), 0);
    }
}
