//! Work queue with per-key backoff

use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use catalog_common::metrics;

use crate::queue::WorkQueue;
use crate::rate_limiter::{
    default_controller_rate_limiter, ItemExponentialFailureRateLimiter, RateLimiter,
};

/// A [`WorkQueue`] whose failed keys come back after a limiter-chosen delay
pub struct RateLimitingQueue<K> {
    queue: WorkQueue<K>,
    limiter: Arc<dyn RateLimiter<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            queue: WorkQueue::new(name),
            limiter,
        }
    }

    /// Queue for transient reconcile failures
    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(default_controller_rate_limiter()))
    }

    /// Queue for long-running broker operations, backing off from `start` up to `max`
    pub fn polling(name: impl Into<String>, start: Duration, max: Duration) -> Self {
        Self::new(
            name,
            Arc::new(ItemExponentialFailureRateLimiter::new(start, max)),
        )
    }

    /// Re-add `key` after its backoff delay
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        metrics::record_queue_retry(self.queue.name());
        self.queue.add_after(key, delay);
    }

    /// Add `key` unless it is queued, in flight or waiting out a backoff
    ///
    /// Lets observers of a resource hand it to the queue without cutting
    /// short a backoff already scheduled for it.
    pub fn add_if_untracked(&self, key: K) {
        if self.limiter.num_requeues(&key) > 0 || self.queue.contains(&key) {
            return;
        }
        self.queue.add(key);
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }
}

impl<K> Deref for RateLimitingQueue<K> {
    type Target = WorkQueue<K>;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let queue = RateLimitingQueue::polling(
            "poller",
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );

        queue.add_rate_limited("i");
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_requeues(&"i"), 1);

        let key = queue.get().await.unwrap();
        queue.add_rate_limited(key);
        queue.done(&key);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(queue.is_empty(), "second retry waits two seconds");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_add_leaves_backoff_alone() {
        let queue = RateLimitingQueue::polling(
            "poller",
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );

        queue.add_if_untracked("i");
        assert_eq!(queue.len(), 1);
        let key = queue.get().await.unwrap();
        queue.add_if_untracked(key);
        queue.add_rate_limited(key);
        queue.done(&key);
        assert!(queue.is_empty(), "in-flight key is not re-queued");

        for _ in 0..5 {
            queue.add_if_untracked("i");
        }
        assert!(queue.is_empty(), "backing-off key waits for its timer");
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.unwrap();
        queue.forget(&key);
        queue.done(&key);
        queue.add_if_untracked("i");
        assert_eq!(queue.len(), 1, "forgotten key is accepted again");
    }

    #[tokio::test]
    async fn forget_resets_requeue_count() {
        let queue: RateLimitingQueue<&str> = RateLimitingQueue::with_default_limiter("broker");
        queue.add_rate_limited("b");
        queue.add_rate_limited("b");
        assert_eq!(queue.num_requeues(&"b"), 2);
        queue.forget(&"b");
        assert_eq!(queue.num_requeues(&"b"), 0);
    }
}
