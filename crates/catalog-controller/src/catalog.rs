//! ServiceClass and ServicePlan reconciliation
//!
//! Classes and plans are owned by their broker's relist; these reconcilers
//! only observe them and flag entries whose broker has disappeared.

use std::sync::Arc;

use async_trait::async_trait;
use catalog_common::Result;
use catalog_queue::Reconcile;
use tracing::{debug, warn};

use crate::context::Context;
use crate::key::ObjectKey;

/// Reconciler for ServiceClass resources
pub struct ClassReconciler {
    ctx: Arc<Context>,
}

impl ClassReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconcile<ObjectKey> for ClassReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(class) = self.ctx.classes.get(key).await? else {
            debug!(class = %key, "Class no longer exists");
            return Ok(());
        };
        check_broker(&self.ctx, "class", key, &class.spec.broker_name).await
    }
}

/// Reconciler for ServicePlan resources
pub struct PlanReconciler {
    ctx: Arc<Context>,
}

impl PlanReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconcile<ObjectKey> for PlanReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(plan) = self.ctx.plans.get(key).await? else {
            debug!(plan = %key, "Plan no longer exists");
            return Ok(());
        };
        check_broker(&self.ctx, "plan", key, &plan.spec.broker_name).await
    }
}

async fn check_broker(ctx: &Context, kind: &str, key: &ObjectKey, broker_name: &str) -> Result<()> {
    if ctx
        .brokers
        .get(&ObjectKey::cluster(broker_name))
        .await?
        .is_none()
    {
        warn!(kind, name = %key, broker = broker_name, "Catalog entry references a missing broker");
    } else {
        debug!(kind, name = %key, "Catalog entry observed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{class, plan, Harness};

    #[tokio::test]
    async fn observing_entries_never_calls_the_broker() {
        let h = Harness::new();
        h.seed_catalog().await;
        h.ctx.classes.create(&class("missing", "orphan")).await.unwrap();

        let classes = ClassReconciler::new(h.ctx.clone());
        classes.reconcile(&ObjectKey::cluster("mysql-id")).await.unwrap();
        classes.reconcile(&ObjectKey::cluster("orphan-id")).await.unwrap();
        classes.reconcile(&ObjectKey::cluster("gone")).await.unwrap();

        h.ctx.plans.create(&plan("missing", "orphan", "tiny")).await.unwrap();
        let plans = PlanReconciler::new(h.ctx.clone());
        plans.reconcile(&ObjectKey::cluster("small-id")).await.unwrap();
        plans.reconcile(&ObjectKey::cluster("tiny-id")).await.unwrap();

        assert!(h.broker.actions().is_empty());
        assert!(h.event_reasons().is_empty());
    }
}
