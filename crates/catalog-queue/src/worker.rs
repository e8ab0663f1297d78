//! Worker loop binding a queue to a reconciler
//!
//! Each worker pops one key, reconciles it, and either forgets the key's
//! backoff, requeues it with backoff, or drops it after too many failures.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use catalog_common::metrics::{self, ReconcileTimer};
use catalog_common::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::rate_limiting::RateLimitingQueue;

/// Retries allowed before a failing key is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// Drives one resource toward its desired state
#[async_trait]
pub trait Reconcile<K>: Send + Sync {
    async fn reconcile(&self, key: &K) -> Result<(), Error>;
}

/// A key abandoned after exhausting its retries
#[derive(Clone, Debug, PartialEq)]
pub struct DroppedKey {
    pub queue: String,
    pub key: String,
    pub last_error: String,
}

/// Consumer of one queue
pub struct Worker<K> {
    queue: RateLimitingQueue<K>,
    reconciler: Arc<dyn Reconcile<K>>,
    kind: &'static str,
    max_retries: u32,
    forget_after_success: bool,
    dropped: Option<mpsc::UnboundedSender<DroppedKey>>,
}

impl<K> Worker<K>
where
    K: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static,
{
    /// Worker that forgets backoff on success and retries up to
    /// [`DEFAULT_MAX_RETRIES`] times
    pub fn new(
        queue: RateLimitingQueue<K>,
        reconciler: Arc<dyn Reconcile<K>>,
        kind: &'static str,
    ) -> Self {
        Self {
            queue,
            reconciler,
            kind,
            max_retries: DEFAULT_MAX_RETRIES,
            forget_after_success: true,
            dropped: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn forget_after_success(mut self, forget: bool) -> Self {
        self.forget_after_success = forget;
        self
    }

    /// Report dropped keys on `tx` in addition to logs and metrics
    pub fn report_dropped(mut self, tx: mpsc::UnboundedSender<DroppedKey>) -> Self {
        self.dropped = Some(tx);
        self
    }

    /// Process keys until the queue shuts down
    pub async fn run(self: Arc<Self>) {
        while self.process_next_item().await {}
        debug!(queue = self.queue.name(), "Worker stopped");
    }

    /// Process one key; false once the queue is shut down
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let timer = ReconcileTimer::start(self.kind);
        match self.reconciler.reconcile(&key).await {
            Ok(()) => {
                timer.success();
                if self.forget_after_success {
                    self.queue.forget(&key);
                }
            }
            Err(err) => {
                timer.error(err.error_type());
                self.handle_error(&key, &err);
            }
        }

        self.queue.done(&key);
        true
    }

    /// Requeue any error, retryable or not, until `max_retries` is reached
    fn handle_error(&self, key: &K, err: &Error) {
        let retries = self.queue.num_requeues(key);
        if retries < self.max_retries {
            debug!(
                queue = self.queue.name(),
                key = %key,
                retries,
                error = %err,
                "Reconcile failed, requeueing with backoff"
            );
            self.queue.add_rate_limited(key.clone());
            return;
        }

        error!(
            queue = self.queue.name(),
            key = %key,
            retries,
            error = %err,
            "Dropping key after exhausting retries"
        );
        metrics::record_queue_drop(self.queue.name());
        self.queue.forget(key);
        if let Some(tx) = &self.dropped {
            let dropped = DroppedKey {
                queue: self.queue.name().to_string(),
                key: key.to_string(),
                last_error: err.to_string(),
            };
            if tx.send(dropped).is_err() {
                warn!(queue = self.queue.name(), "Dropped-key receiver is gone");
            }
        }
    }
}

/// Spawn `count` tasks running `worker`
pub fn spawn_workers<K>(worker: Arc<Worker<K>>, count: usize) -> Vec<JoinHandle<()>>
where
    K: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static,
{
    (0..count.max(1))
        .map(|_| tokio::spawn(Arc::clone(&worker).run()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Fails the first `failures` calls, counting every call
    struct FlakyReconciler {
        calls: AtomicUsize,
        failures: usize,
    }

    impl FlakyReconciler {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reconcile<&'static str> for FlakyReconciler {
        async fn reconcile(&self, key: &&'static str) -> Result<(), Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::internal("test", format!("{key} failed")))
            } else {
                Ok(())
            }
        }
    }

    fn queue() -> RateLimitingQueue<&'static str> {
        RateLimitingQueue::with_default_limiter("test")
    }

    #[tokio::test]
    async fn success_forgets_backoff() {
        let queue = queue();
        let reconciler = FlakyReconciler::new(0);
        let worker = Worker::new(queue.clone(), reconciler.clone(), "test");

        queue.add_rate_limited("a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.process_next_item().await);

        assert_eq!(reconciler.calls(), 1);
        assert_eq!(queue.num_requeues(&"a"), 0);
        assert!(!queue.is_processing(&"a"));
    }

    #[tokio::test]
    async fn poll_style_worker_keeps_backoff_on_success() {
        let queue = queue();
        let worker = Worker::new(queue.clone(), FlakyReconciler::new(0), "poll")
            .forget_after_success(false);

        queue.add_rate_limited("a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.process_next_item().await;
        assert_eq!(queue.num_requeues(&"a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_until_success() {
        let queue = queue();
        let reconciler = FlakyReconciler::new(3);
        let worker = Worker::new(queue.clone(), reconciler.clone(), "test");

        queue.add("a");
        for _ in 0..4 {
            assert!(worker.process_next_item().await);
        }
        assert_eq!(reconciler.calls(), 4);
        assert_eq!(queue.num_requeues(&"a"), 0);
        assert!(queue.is_empty());
    }

    struct RejectingReconciler;

    #[async_trait]
    impl Reconcile<&'static str> for RejectingReconciler {
        async fn reconcile(&self, key: &&'static str) -> Result<(), Error> {
            Err(Error::validation(*key, "rejected"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_still_back_off() {
        let queue = queue();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Worker::new(queue.clone(), Arc::new(RejectingReconciler), "test")
            .report_dropped(tx);

        queue.add("bad");
        assert!(worker.process_next_item().await);
        assert!(rx.try_recv().is_err(), "not dropped on first failure");
        assert_eq!(queue.num_requeues(&"bad"), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_key_is_dropped_and_reported() {
        let queue = queue();
        let reconciler = FlakyReconciler::new(usize::MAX);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Worker::new(queue.clone(), reconciler.clone(), "test")
            .max_retries(2)
            .report_dropped(tx);

        queue.add("stuck");
        for _ in 0..3 {
            worker.process_next_item().await;
        }

        assert_eq!(reconciler.calls(), 3);
        let dropped = rx.try_recv().expect("drop must be reported");
        assert_eq!(dropped.key, "stuck");
        assert_eq!(dropped.queue, "test");
        assert!(dropped.last_error.contains("stuck failed"));
        assert_eq!(queue.num_requeues(&"stuck"), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_empty(), "dropped key is not requeued");
    }

    /// Blocks inside reconcile until released, counting entries
    struct GatedReconciler {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconcile<&'static str> for GatedReconciler {
        async fn reconcile(&self, _key: &&'static str) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn burst_of_adds_during_reconcile_yields_one_more_pass() {
        let queue = queue();
        let reconciler = Arc::new(GatedReconciler {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let worker = Arc::new(Worker::new(queue.clone(), reconciler.clone(), "test"));
        let handles = spawn_workers(Arc::clone(&worker), 4);

        queue.add("a");
        reconciler.entered.notified().await;
        for _ in 0..10 {
            queue.add("a");
        }
        reconciler.release.notify_one();

        reconciler.entered.notified().await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
        reconciler.release.notify_one();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);

        queue.shut_down();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_work_finish() {
        let queue = queue();
        let reconciler = Arc::new(GatedReconciler {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let worker = Arc::new(Worker::new(queue.clone(), reconciler.clone(), "test"));
        let handles = spawn_workers(worker, 2);

        queue.add("a");
        reconciler.entered.notified().await;
        queue.add("b");
        queue.shut_down();
        reconciler.release.notify_one();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1, "b is never dequeued");
    }
}
