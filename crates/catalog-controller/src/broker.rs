//! ServiceBroker reconciliation
//!
//! Fetches a broker's catalog and mirrors it as ServiceClass and ServicePlan
//! resources. Relists on the broker's schedule, gives up after the configured
//! retry duration, and removes the mirrored catalog when the broker is
//! deleted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_common::condition::{find_condition, is_failed, set_condition};
use catalog_common::crd::{
    CatalogResource, ConditionStatus, ConditionType, RelistBehavior, ServiceBroker, ServiceClass,
    ServiceClassSpec, ServicePlan, ServicePlanSpec,
};
use catalog_common::events::actions;
use catalog_common::metrics::record_broker_call;
use catalog_common::reason::BrokerReason;
use catalog_common::{Error, Result};
use catalog_osb::CatalogResponse;
use catalog_queue::Reconcile;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::key::ObjectKey;
use crate::resolver::{client_for_broker, ResolveError};
use crate::status::{
    ensure_finalizer, has_finalizer, is_deleting, normal_event, remove_finalizer, warning_event,
    write_status,
};
use crate::store::ResourceStore;

const FETCHED_CATALOG_MESSAGE: &str = "Successfully fetched catalog entries from broker.";
const DELETED_MESSAGE: &str = "The broker was deleted successfully.";
const RETRY_TIMEOUT_MESSAGE: &str =
    "Stopping reconciliation retries because too much time has elapsed";

/// Whether a broker is due for a relist at `now`
///
/// Deleting brokers, brokers never reconciled at their current generation
/// and brokers that are not Ready always qualify. A broker marked Failed at
/// its current generation never does. A Ready broker relists once its relist
/// interval has strictly passed since the last successful fetch, unless
/// relisting is manual.
pub fn should_reconcile(broker: &ServiceBroker, default_relist: Duration, now: DateTime<Utc>) -> bool {
    if is_deleting(broker) {
        return true;
    }
    let Some(status) = broker.status.as_ref() else {
        return true;
    };
    if status.reconciled_generation != broker.metadata.generation.unwrap_or(0) {
        return true;
    }
    if is_failed(&status.conditions) {
        return false;
    }
    let Some(ready) = find_condition(&status.conditions, ConditionType::Ready) else {
        return true;
    };
    if ready.status != ConditionStatus::True {
        return true;
    }
    if broker.spec.relist_behavior == RelistBehavior::Manual {
        return false;
    }

    let last_fetch = status
        .last_catalog_retrieval_time
        .unwrap_or(ready.last_transition_time);
    let elapsed = (now - last_fetch).to_std().unwrap_or_default();
    elapsed > relist_interval(broker, default_relist)
}

/// The broker's relist interval, falling back to `default` when unset or zero
pub fn relist_interval(broker: &ServiceBroker, default: Duration) -> Duration {
    broker
        .spec
        .relist_duration_seconds
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Convert a broker catalog into the classes and plans that mirror it
///
/// Classes are named by service ID and plans by plan ID. A catalog with no
/// services, a service without plans, or a repeated ID is rejected.
pub fn convert_catalog(
    broker_name: &str,
    catalog: &CatalogResponse,
) -> std::result::Result<(Vec<ServiceClass>, Vec<ServicePlan>), String> {
    if catalog.services.is_empty() {
        return Err("broker catalog contains no services".to_string());
    }

    let mut ids = HashSet::new();
    let mut classes = Vec::with_capacity(catalog.services.len());
    let mut plans = Vec::new();
    for service in &catalog.services {
        if service.id.is_empty() {
            return Err(format!("service {:?} has an empty ID", service.name));
        }
        if service.plans.is_empty() {
            return Err(format!(
                "service {:?} ({}) has no plans",
                service.name, service.id
            ));
        }
        if !ids.insert(service.id.as_str()) {
            return Err(format!("duplicate catalog ID {:?}", service.id));
        }

        classes.push(ServiceClass::new(
            &service.id,
            ServiceClassSpec {
                broker_name: broker_name.to_string(),
                external_id: service.id.clone(),
                external_name: service.name.clone(),
                description: service.description.clone(),
                bindable: service.bindable,
                plan_updatable: service.plan_updatable.unwrap_or(false),
                tags: service.tags.clone(),
                requires: service.requires.clone(),
                external_metadata: service.metadata.clone(),
            },
        ));

        for plan in &service.plans {
            if plan.id.is_empty() {
                return Err(format!(
                    "plan {:?} of service {:?} has an empty ID",
                    plan.name, service.name
                ));
            }
            if !ids.insert(plan.id.as_str()) {
                return Err(format!("duplicate catalog ID {:?}", plan.id));
            }
            let schemas = plan.schemas.clone().unwrap_or_default();
            plans.push(ServicePlan::new(
                &plan.id,
                ServicePlanSpec {
                    broker_name: broker_name.to_string(),
                    service_class_ref: service.id.clone(),
                    external_id: plan.id.clone(),
                    external_name: plan.name.clone(),
                    description: plan.description.clone(),
                    free: plan.free,
                    bindable: plan.bindable,
                    external_metadata: plan.metadata.clone(),
                    instance_create_parameter_schema: schemas.instance_create,
                    instance_update_parameter_schema: schemas.instance_update,
                    binding_create_parameter_schema: schemas.binding_create,
                },
            ));
        }
    }
    Ok((classes, plans))
}

/// Class or plan mirrored from a broker catalog
trait CatalogEntry: CatalogResource {
    fn broker_name(&self) -> &str;
    fn external_id(&self) -> &str;
    fn removed(&self) -> bool;
    fn set_removed(&mut self, removed: bool);
}

macro_rules! catalog_entry {
    ($($kind:ty),+) => {
        $(impl CatalogEntry for $kind {
            fn broker_name(&self) -> &str {
                &self.spec.broker_name
            }

            fn external_id(&self) -> &str {
                &self.spec.external_id
            }

            fn removed(&self) -> bool {
                self.status
                    .as_ref()
                    .is_some_and(|s| s.removed_from_broker_catalog)
            }

            fn set_removed(&mut self, removed: bool) {
                self.status_or_default().removed_from_broker_catalog = removed;
            }
        })+
    };
}

catalog_entry!(ServiceClass, ServicePlan);

/// Reconciler for [`ServiceBroker`] resources
pub struct BrokerReconciler {
    ctx: Arc<Context>,
}

impl BrokerReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, broker), fields(broker = %broker.name_any()))]
    pub async fn reconcile_broker(&self, broker: ServiceBroker, now: DateTime<Utc>) -> Result<()> {
        if is_deleting(&broker) {
            return self.reconcile_deletion(broker, now).await;
        }
        if !should_reconcile(&broker, self.ctx.config.broker_relist_interval(), now) {
            debug!("Catalog is current, skipping relist");
            return Ok(());
        }

        info!("Relisting broker catalog");
        let broker = ensure_finalizer(self.ctx.brokers.as_ref(), broker).await?;
        let name = broker.name_any();

        let client = match client_for_broker(&self.ctx, &broker).await {
            Ok(client) => client,
            Err(ResolveError::Store(e)) => return Err(e),
            Err(e) => {
                let reason = e
                    .broker_reason()
                    .unwrap_or(BrokerReason::ErrorFetchingCatalog);
                let message = e.to_string();
                return self
                    .fail(broker, reason, message, e.into_error("ServiceBroker"), now)
                    .await;
            }
        };

        let result = client.get_catalog().await;
        record_broker_call("get_catalog", &result);
        let catalog = match result {
            Ok(catalog) => catalog,
            Err(e) => {
                let message = format!("Error getting broker catalog: {e}");
                return self
                    .fail(
                        broker,
                        BrokerReason::ErrorFetchingCatalog,
                        message,
                        Error::broker("get catalog", e),
                        now,
                    )
                    .await;
            }
        };

        let (classes, plans) = match convert_catalog(&name, &catalog) {
            Ok(converted) => converted,
            Err(msg) => {
                let message = format!("Error converting broker catalog: {msg}");
                return self
                    .fail(
                        broker,
                        BrokerReason::ErrorSyncingCatalog,
                        message,
                        Error::validation(format!("ServiceBroker/{name}"), msg),
                        now,
                    )
                    .await;
            }
        };
        debug!(
            classes = classes.len(),
            plans = plans.len(),
            "Converted broker catalog"
        );

        if let Err(e) = self.sync_catalog(&name, classes, plans).await {
            let message = format!("Error syncing catalog: {e}");
            return self
                .fail(broker, BrokerReason::ErrorSyncingCatalog, message, e, now)
                .await;
        }

        let mut updated = broker.clone();
        let generation = broker.metadata.generation.unwrap_or(0);
        let status = updated.status_or_default();
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            BrokerReason::FetchedCatalog.as_str(),
            FETCHED_CATALOG_MESSAGE,
            now,
        );
        status.conditions.retain(|c| c.type_ != ConditionType::Failed);
        status.reconciled_generation = generation;
        status.operation_start_time = None;
        status.last_catalog_retrieval_time = Some(now);
        let stored = write_status(self.ctx.brokers.as_ref(), &broker, updated).await?;

        normal_event(
            self.ctx.events.as_ref(),
            &stored,
            BrokerReason::FetchedCatalog.as_str(),
            actions::RELIST,
            FETCHED_CATALOG_MESSAGE,
        )
        .await;

        if stored.spec.relist_behavior == RelistBehavior::Duration {
            let interval = relist_interval(&stored, self.ctx.config.broker_relist_interval());
            debug!(?interval, "Scheduling next relist");
            self.ctx
                .queues
                .brokers
                .add_after(ObjectKey::of(&stored), interval);
        }
        info!("Broker catalog synced");
        Ok(())
    }

    /// Record a failed relist, marking the broker Failed once retries time out
    async fn fail(
        &self,
        broker: ServiceBroker,
        reason: BrokerReason,
        message: String,
        error: Error,
        now: DateTime<Utc>,
    ) -> Result<()> {
        warn!(%reason, %message, "Broker reconcile failed");
        let retry_duration = self.ctx.config.reconciliation_retry_duration();
        let generation = broker.metadata.generation.unwrap_or(0);

        let mut updated = broker.clone();
        let status = updated.status_or_default();
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            reason.as_str(),
            &message,
            now,
        );
        let timed_out = match status.operation_start_time {
            None => {
                status.operation_start_time = Some(now);
                false
            }
            Some(start) => (now - start).to_std().unwrap_or_default() >= retry_duration,
        };
        if timed_out {
            set_condition(
                &mut status.conditions,
                ConditionType::Failed,
                ConditionStatus::True,
                BrokerReason::ErrorReconciliationRetryTimeout.as_str(),
                RETRY_TIMEOUT_MESSAGE,
                now,
            );
            status.operation_start_time = None;
            status.reconciled_generation = generation;
        }

        let stored = write_status(self.ctx.brokers.as_ref(), &broker, updated).await?;
        warning_event(
            self.ctx.events.as_ref(),
            &stored,
            reason.as_str(),
            actions::RELIST,
            message,
        )
        .await;

        if timed_out {
            warn!("Giving up on broker after exhausting the retry duration");
            warning_event(
                self.ctx.events.as_ref(),
                &stored,
                BrokerReason::ErrorReconciliationRetryTimeout.as_str(),
                actions::RELIST,
                RETRY_TIMEOUT_MESSAGE,
            )
            .await;
            return Ok(());
        }
        Err(error)
    }

    async fn sync_catalog(
        &self,
        broker_name: &str,
        classes: Vec<ServiceClass>,
        plans: Vec<ServicePlan>,
    ) -> Result<()> {
        sync_entries(self.ctx.classes.as_ref(), broker_name, classes).await?;
        sync_entries(self.ctx.plans.as_ref(), broker_name, plans).await
    }

    async fn reconcile_deletion(&self, broker: ServiceBroker, now: DateTime<Utc>) -> Result<()> {
        if !has_finalizer(&broker) {
            return Ok(());
        }
        let name = broker.name_any();
        info!("Removing catalog of deleted broker");

        let classes = match self.ctx.classes.list().await {
            Ok(all) => owned_by(all, &name),
            Err(e) => {
                return self
                    .deletion_failed(broker, BrokerReason::ErrorListingServiceClasses, e, now)
                    .await
            }
        };
        let plans = match self.ctx.plans.list().await {
            Ok(all) => owned_by(all, &name),
            Err(e) => {
                return self
                    .deletion_failed(broker, BrokerReason::ErrorListingServicePlans, e, now)
                    .await
            }
        };

        for plan in &plans {
            if let Err(e) = delete_if_present(self.ctx.plans.as_ref(), plan).await {
                return self
                    .deletion_failed(broker, BrokerReason::ErrorDeletingServicePlan, e, now)
                    .await;
            }
        }
        for class in &classes {
            if let Err(e) = delete_if_present(self.ctx.classes.as_ref(), class).await {
                return self
                    .deletion_failed(broker, BrokerReason::ErrorDeletingServiceClass, e, now)
                    .await;
            }
        }

        let mut updated = broker.clone();
        set_condition(
            &mut updated.status_or_default().conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            BrokerReason::DeletedSuccessfully.as_str(),
            DELETED_MESSAGE,
            now,
        );
        let stored = write_status(self.ctx.brokers.as_ref(), &broker, updated).await?;
        remove_finalizer(self.ctx.brokers.as_ref(), &stored).await?;
        normal_event(
            self.ctx.events.as_ref(),
            &stored,
            BrokerReason::DeletedSuccessfully.as_str(),
            actions::DELETE,
            DELETED_MESSAGE,
        )
        .await;
        info!(
            classes = classes.len(),
            plans = plans.len(),
            "Broker catalog removed"
        );
        Ok(())
    }

    async fn deletion_failed(
        &self,
        broker: ServiceBroker,
        reason: BrokerReason,
        error: Error,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let message = format!("Error removing broker catalog: {error}");
        warn!(%reason, %message, "Broker deletion failed");
        let mut updated = broker.clone();
        set_condition(
            &mut updated.status_or_default().conditions,
            ConditionType::Ready,
            ConditionStatus::Unknown,
            reason.as_str(),
            &message,
            now,
        );
        let stored = write_status(self.ctx.brokers.as_ref(), &broker, updated).await?;
        warning_event(
            self.ctx.events.as_ref(),
            &stored,
            reason.as_str(),
            actions::DELETE,
            message,
        )
        .await;
        Err(error)
    }
}

#[async_trait]
impl Reconcile<ObjectKey> for BrokerReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(broker) = self.ctx.brokers.get(key).await? else {
            debug!(broker = %key, "Broker no longer exists");
            return Ok(());
        };
        self.reconcile_broker(broker, Utc::now()).await
    }
}

fn owned_by<K: CatalogEntry>(entries: Vec<K>, broker_name: &str) -> Vec<K> {
    entries
        .into_iter()
        .filter(|e| e.broker_name() == broker_name)
        .collect()
}

async fn delete_if_present<K: CatalogEntry>(store: &dyn ResourceStore<K>, entry: &K) -> Result<()> {
    match store.delete(&ObjectKey::of(entry)).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create or refresh `desired` entries and flag this broker's other entries
/// as removed from its catalog
async fn sync_entries<K: CatalogEntry>(
    store: &dyn ResourceStore<K>,
    broker_name: &str,
    desired: Vec<K>,
) -> Result<()> {
    let mut existing: HashMap<String, K> = store
        .list()
        .await?
        .into_iter()
        .map(|e| (e.name_any(), e))
        .collect();

    for entry in desired {
        let name = entry.name_any();
        match existing.remove(&name) {
            None => {
                store.create(&entry).await?;
                debug!(kind = K::LABEL, %name, "Created catalog entry");
            }
            Some(current) => refresh_entry(store, broker_name, current, entry).await?,
        }
    }

    for (name, mut stale) in existing {
        if stale.broker_name() != broker_name || stale.removed() {
            continue;
        }
        info!(kind = K::LABEL, %name, "Entry no longer offered by broker");
        stale.set_removed(true);
        store.update_status(&stale).await?;
    }
    Ok(())
}

async fn refresh_entry<K: CatalogEntry>(
    store: &dyn ResourceStore<K>,
    broker_name: &str,
    mut current: K,
    desired: K,
) -> Result<()> {
    let resource = format!("{}/{}", K::kind(&()), current.name_any());
    if current.broker_name() != broker_name {
        return Err(Error::validation(
            resource,
            format!("already provided by broker {:?}", current.broker_name()),
        ));
    }
    if current.external_id() != desired.external_id() {
        return Err(Error::validation(
            resource,
            format!(
                "external ID {:?} does not match catalog ID {:?}",
                current.external_id(),
                desired.external_id()
            ),
        ));
    }

    if current.spec() != desired.spec() {
        *current.spec_mut() = desired.spec().clone();
        current = store.update(&current).await?;
        debug!(kind = K::LABEL, %resource, "Updated catalog entry");
    }
    if current.removed() {
        current.set_removed(false);
        store.update_status(&current).await?;
    }
    Ok(())
}
