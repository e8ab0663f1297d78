//! Controller manager
//!
//! Wires store watches into the per-kind queues, runs a periodic resync and
//! the worker pools, and tears everything down on shutdown.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use catalog_common::crd::{CatalogResource, ServiceInstance};
use catalog_queue::{spawn_workers, DroppedKey, RateLimitingQueue, Reconcile, Worker};
use futures::StreamExt;
use kube::ResourceExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binding::BindingReconciler;
use crate::broker::BrokerReconciler;
use crate::catalog::{ClassReconciler, PlanReconciler};
use crate::context::Context;
use crate::instance::InstanceReconciler;
use crate::key::ObjectKey;
use crate::poll::PollReconciler;
use crate::store::{ResourceStore, WatchEvent};

/// Runs every reconciler of the service catalog against one [`Context`]
pub struct ControllerManager {
    ctx: Arc<Context>,
    dropped: Option<UnboundedSender<DroppedKey>>,
}

impl ControllerManager {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, dropped: None }
    }

    /// Report keys dropped after exhausting their retries on `tx`
    pub fn report_dropped(mut self, tx: UnboundedSender<DroppedKey>) -> Self {
        self.dropped = Some(tx);
        self
    }

    /// Run until `shutdown` resolves, then drain the workers
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let ctx = &self.ctx;
        let config = &ctx.config;
        let queues = &ctx.queues;
        info!(
            workers = config.workers,
            resync_secs = config.resync_period_secs,
            "Starting service catalog controller"
        );

        let mut background = vec![
            feed(ctx.brokers.clone(), queues.brokers.clone()),
            feed(ctx.classes.clone(), queues.classes.clone()),
            feed(ctx.plans.clone(), queues.plans.clone()),
            feed_instances(ctx.clone()),
            feed(ctx.bindings.clone(), queues.bindings.clone()),
        ];
        background.push(spawn_resync(ctx.clone()));

        let mut workers = Vec::new();
        workers.extend(self.spawn(
            queues.brokers.clone(),
            Arc::new(BrokerReconciler::new(ctx.clone())),
            "broker",
            config.max_retries,
        ));
        workers.extend(self.spawn(
            queues.classes.clone(),
            Arc::new(ClassReconciler::new(ctx.clone())),
            "class",
            config.max_retries,
        ));
        workers.extend(self.spawn(
            queues.plans.clone(),
            Arc::new(PlanReconciler::new(ctx.clone())),
            "plan",
            config.max_retries,
        ));
        workers.extend(self.spawn(
            queues.instances.clone(),
            Arc::new(InstanceReconciler::new(ctx.clone())),
            "instance",
            config.max_retries,
        ));
        workers.extend(self.spawn(
            queues.bindings.clone(),
            Arc::new(BindingReconciler::new(ctx.clone())),
            "binding",
            config.max_retries,
        ));
        // An operation still in progress is reported as an error; polling
        // continues at the maximum backoff instead of being dropped.
        workers.extend(self.spawn(
            queues.polling.clone(),
            Arc::new(PollReconciler::new(ctx.clone())),
            "poll",
            u32::MAX,
        ));

        shutdown.await;
        info!("Shutdown requested, stopping queues");
        queues.shut_down();
        for handle in background {
            handle.abort();
        }
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Service catalog controller stopped");
    }

    fn spawn<K>(
        &self,
        queue: RateLimitingQueue<K>,
        reconciler: Arc<dyn Reconcile<K>>,
        kind: &'static str,
        max_retries: u32,
    ) -> Vec<JoinHandle<()>>
    where
        K: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static,
    {
        let mut worker = Worker::new(queue, reconciler, kind).max_retries(max_retries);
        if let Some(tx) = &self.dropped {
            worker = worker.report_dropped(tx.clone());
        }
        spawn_workers(Arc::new(worker), self.ctx.config.workers)
    }
}

/// Queue the key of every object the store reports
fn feed<K: CatalogResource>(
    store: Arc<dyn ResourceStore<K>>,
    queue: RateLimitingQueue<ObjectKey>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = store.watch();
        while let Some(event) = events.next().await {
            let (WatchEvent::Applied(obj) | WatchEvent::Deleted(obj)) = event;
            queue.add(ObjectKey::of(&obj));
        }
        debug!(kind = K::LABEL, "Watch stream ended");
    })
}

/// Instances also wake the bindings that reference them, so a binding
/// waiting for its instance to become Ready is retried promptly
fn feed_instances(ctx: Arc<Context>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = ctx.instances.watch();
        while let Some(event) = events.next().await {
            let (WatchEvent::Applied(instance) | WatchEvent::Deleted(instance)) = event;
            ctx.queues.instances.add(ObjectKey::of(&instance));
            enqueue_bindings_of(&ctx, &instance).await;
        }
        debug!(kind = ServiceInstance::LABEL, "Watch stream ended");
    })
}

pub(crate) async fn enqueue_bindings_of(ctx: &Context, instance: &ServiceInstance) {
    let bindings = match ctx.bindings.list().await {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!(error = %e, "Failed to list bindings for instance change");
            return;
        }
    };
    let name = instance.name_any();
    let namespace = instance.namespace();
    for binding in bindings
        .iter()
        .filter(|b| b.spec.instance_ref == name && b.namespace() == namespace)
    {
        ctx.queues.bindings.add(ObjectKey::of(binding));
    }
}

fn spawn_resync(ctx: Arc<Context>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.resync_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; watches already list everything
        ticker.tick().await;
        loop {
            ticker.tick().await;
            resync(&ctx).await;
        }
    })
}

/// Re-add every known key to its queue
pub(crate) async fn resync(ctx: &Context) {
    debug!("Resyncing all resources");
    requeue_all(ctx.brokers.as_ref(), &ctx.queues.brokers).await;
    requeue_all(ctx.classes.as_ref(), &ctx.queues.classes).await;
    requeue_all(ctx.plans.as_ref(), &ctx.queues.plans).await;
    requeue_all(ctx.instances.as_ref(), &ctx.queues.instances).await;
    requeue_all(ctx.bindings.as_ref(), &ctx.queues.bindings).await;
}

async fn requeue_all<K: CatalogResource>(
    store: &dyn ResourceStore<K>,
    queue: &RateLimitingQueue<ObjectKey>,
) {
    match store.list().await {
        Ok(objects) => {
            for obj in &objects {
                queue.add(ObjectKey::of(obj));
            }
        }
        Err(e) => warn!(kind = K::LABEL, error = %e, "Resync list failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, NAMESPACE};
    use catalog_common::crd::{ServiceBinding, ServiceBindingSpec};
    use std::time::Duration;

    #[tokio::test]
    async fn instance_change_wakes_only_its_bindings() {
        let h = Harness::new();
        let instance = h.create_instance("db").await;
        h.create_binding("creds", "db").await;
        h.create_binding("other", "cache").await;
        let mut elsewhere = ServiceBinding::new("remote", ServiceBindingSpec::new("db", "remote"));
        elsewhere.metadata.namespace = Some("team-b".to_string());
        h.ctx.bindings.create(&elsewhere).await.unwrap();

        enqueue_bindings_of(&h.ctx, &instance).await;

        assert_eq!(h.ctx.queues.bindings.len(), 1);
        assert_eq!(
            h.ctx.queues.bindings.get().await,
            Some(ObjectKey::namespaced(NAMESPACE, "creds"))
        );
    }

    #[tokio::test]
    async fn resync_requeues_every_kind() {
        let h = Harness::new();
        h.seed_catalog().await;
        h.create_instance("db").await;
        h.create_binding("creds", "db").await;

        resync(&h.ctx).await;

        let queues = &h.ctx.queues;
        assert_eq!(queues.brokers.len(), 1);
        assert_eq!(queues.classes.len(), 1);
        assert_eq!(queues.plans.len(), 1);
        assert_eq!(queues.instances.len(), 1);
        assert_eq!(queues.bindings.len(), 1);
    }

    #[tokio::test]
    async fn run_stops_when_shutdown_resolves() {
        let h = Harness::new();
        h.seed_catalog().await;
        let manager = ControllerManager::new(h.ctx.clone());

        tokio::time::timeout(
            Duration::from_secs(5),
            manager.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("manager should stop after shutdown");
        assert!(h.ctx.queues.brokers.is_shutting_down());
        assert!(h.ctx.queues.polling.is_shutting_down());
    }
}
