//! ServiceInstance reconciliation
//!
//! Provisions, updates and deprovisions instances at their broker. The spec
//! checksum recorded in status decides whether a spec has already been sent;
//! asynchronous operations are handed to the poller in [`crate::poll`].

use std::sync::Arc;

use async_trait::async_trait;
use catalog_common::checksum::{instance_checksum, is_unchanged};
use catalog_common::condition::{is_failed, set_condition};
use catalog_common::crd::{
    AsyncOperationStatus, CatalogResource, ConditionStatus, ConditionType, OperationKind,
    ServiceInstance,
};
use catalog_common::events::actions;
use catalog_common::metrics::record_broker_call;
use catalog_common::reason::InstanceReason;
use catalog_common::{Error, Result};
use catalog_osb::{BrokerError, DeprovisionRequest, Parameters, ProvisionRequest, UpdateInstanceRequest};
use catalog_queue::Reconcile;
use chrono::Utc;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::key::ObjectKey;
use crate::parameters::{parameters_map, platform_context};
use crate::poll::PollTarget;
use crate::resolver::{resolve_instance, ResolveError, Resolved};
use crate::status::{
    ensure_finalizer, has_finalizer, is_deleting, normal_event, remove_finalizer, warning_event,
    write_status,
};

pub(crate) const EMPTY_EXTERNAL_ID: &str = "spec.externalID must not be empty";
pub(crate) const PROVISIONED_MESSAGE: &str = "The instance was provisioned successfully";
pub(crate) const PROVISIONING_MESSAGE: &str = "The instance is being provisioned asynchronously";
pub(crate) const UPDATED_MESSAGE: &str = "The instance was updated successfully";
pub(crate) const UPDATING_MESSAGE: &str = "The instance is being updated asynchronously";
pub(crate) const DEPROVISIONED_MESSAGE: &str = "The instance was deprovisioned successfully";
pub(crate) const DEPROVISIONING_MESSAGE: &str =
    "The instance is being deprovisioned asynchronously";

/// A precondition that failed before the broker was called
struct Blocked {
    /// `None` for store failures, which leave status untouched
    reason: Option<InstanceReason>,
    message: String,
    error: Error,
}

impl From<ResolveError> for Blocked {
    fn from(e: ResolveError) -> Self {
        Self {
            reason: e.instance_reason(),
            message: e.to_string(),
            error: e.into_error("ServiceInstance"),
        }
    }
}

/// Everything a provision or update request needs
struct Prepared {
    resolved: Resolved,
    parameters: Option<Parameters>,
    context: Map<String, Value>,
    namespace_uid: String,
}

/// Reconciler for [`ServiceInstance`] resources
pub struct InstanceReconciler {
    ctx: Arc<Context>,
}

impl InstanceReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, instance), fields(instance = %ObjectKey::of(&instance)))]
    pub async fn reconcile_instance(&self, instance: ServiceInstance) -> Result<()> {
        let key = ObjectKey::of(&instance);
        let status = instance.status.clone().unwrap_or_default();

        if status.async_op_in_progress {
            debug!("Asynchronous operation in flight, handing to poller");
            self.ctx
                .queues
                .polling
                .add_if_untracked(PollTarget::Instance(key));
            return Ok(());
        }
        if is_deleting(&instance) {
            return self.reconcile_deletion(instance).await;
        }
        if is_failed(&status.conditions) {
            debug!("Instance failed permanently, skipping");
            return Ok(());
        }
        let checksum = instance_checksum(&instance.spec);
        if is_unchanged(&checksum, status.checksum.as_deref(), false, false) {
            debug!("Spec unchanged since last sent to broker");
            return Ok(());
        }

        let instance = ensure_finalizer(self.ctx.instances.as_ref(), instance).await?;
        if status.provisioned {
            self.update(instance, checksum).await
        } else {
            self.provision(instance, checksum).await
        }
    }

    async fn prepare(&self, instance: &ServiceInstance) -> std::result::Result<Prepared, Blocked> {
        if instance.spec.external_id.is_empty() {
            let message = EMPTY_EXTERNAL_ID.to_string();
            return Err(Blocked {
                reason: Some(InstanceReason::ErrorValidatingSpec),
                error: Error::validation(ObjectKey::of(instance).to_string(), &message),
                message,
            });
        }
        let resolved = resolve_instance(&self.ctx, &instance.spec).await?;
        let parameters = parameters_map(instance.spec.parameters.as_ref()).map_err(|msg| Blocked {
            reason: Some(InstanceReason::ErrorWithParameters),
            message: format!("Error building parameters: {msg}"),
            error: Error::parameters(msg),
        })?;

        let namespace = instance.namespace().unwrap_or_default();
        let namespace_uid = match self.ctx.core.namespace_uid(&namespace).await {
            Ok(Some(uid)) => uid,
            Ok(None) => {
                return Err(Blocked {
                    reason: Some(InstanceReason::ErrorFindingNamespaceForInstance),
                    message: format!("Namespace {namespace:?} not found"),
                    error: Error::not_found("Namespace", namespace),
                })
            }
            Err(e) => {
                return Err(Blocked {
                    reason: Some(InstanceReason::ErrorFindingNamespaceForInstance),
                    message: format!("Failed to get namespace {namespace:?}: {e}"),
                    error: e,
                })
            }
        };

        Ok(Prepared {
            resolved,
            parameters,
            context: platform_context(&namespace),
            namespace_uid,
        })
    }

    /// Set Ready=False with the blocking reason and surface the error
    async fn blocked(&self, instance: ServiceInstance, blocked: Blocked, action: &str) -> Result<()> {
        let Some(reason) = blocked.reason else {
            return Err(blocked.error);
        };
        warn!(%reason, message = %blocked.message, "Instance blocked");
        let mut updated = instance.clone();
        set_condition(
            &mut updated.status_or_default().conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            reason.as_str(),
            &blocked.message,
            Utc::now(),
        );
        let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
        warning_event(
            self.ctx.events.as_ref(),
            &stored,
            reason.as_str(),
            action,
            blocked.message,
        )
        .await;
        Err(blocked.error)
    }

    async fn provision(&self, instance: ServiceInstance, checksum: String) -> Result<()> {
        let Prepared {
            resolved,
            parameters,
            context,
            namespace_uid,
        } = match self.prepare(&instance).await {
            Ok(prepared) => prepared,
            Err(blocked) => return self.blocked(instance, blocked, actions::PROVISION).await,
        };

        let request = ProvisionRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: resolved.plan.spec.external_id.clone(),
            organization_guid: namespace_uid.clone(),
            space_guid: namespace_uid,
            parameters,
            context,
        };
        info!(broker = %resolved.broker.name_any(), "Provisioning instance");
        let result = resolved.client.provision_instance(&request).await;
        record_broker_call("provision", &result);

        let now = Utc::now();
        let mut updated = instance.clone();
        let status = updated.status_or_default();
        match result {
            Ok(response) => {
                status.set_checksum(Some(checksum));
                if response.dashboard_url.is_some() {
                    status.dashboard_url = response.dashboard_url;
                }
                let (reason, message) = if response.is_async {
                    status.begin_operation(OperationKind::Provision, true, response.operation_key);
                    (InstanceReason::Provisioning, PROVISIONING_MESSAGE)
                } else {
                    status.begin_operation(OperationKind::Provision, false, None);
                    status.provisioned = true;
                    (InstanceReason::ProvisionedSuccessfully, PROVISIONED_MESSAGE)
                };
                let ready = if response.is_async {
                    ConditionStatus::False
                } else {
                    ConditionStatus::True
                };
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ready,
                    reason.as_str(),
                    message,
                    now,
                );
                let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
                normal_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    reason.as_str(),
                    actions::PROVISION,
                    message,
                )
                .await;
                if response.is_async {
                    self.ctx
                        .queues
                        .polling
                        .add(PollTarget::Instance(ObjectKey::of(&stored)));
                }
                info!(is_async = response.is_async, "Provision accepted by broker");
                Ok(())
            }
            Err(BrokerError::Http(http)) => {
                let message = format!(
                    "Error provisioning ServiceInstance of ServiceClass {:?} at ServiceBroker {:?}: {http}",
                    resolved.class.spec.external_name,
                    resolved.broker.name_any()
                );
                warn!(%message, "Broker rejected provision");
                status.set_checksum(Some(checksum));
                set_condition(
                    &mut status.conditions,
                    ConditionType::Failed,
                    ConditionStatus::True,
                    InstanceReason::BrokerReturnedFailure.as_str(),
                    &message,
                    now,
                );
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    InstanceReason::ProvisionCallFailed.as_str(),
                    &message,
                    now,
                );
                let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
                warning_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    InstanceReason::ProvisionCallFailed.as_str(),
                    actions::PROVISION,
                    message,
                )
                .await;
                Ok(())
            }
            Err(e) => {
                let message = format!(
                    "Error provisioning ServiceInstance of ServiceClass {:?} at ServiceBroker {:?}: {e}",
                    resolved.class.spec.external_name,
                    resolved.broker.name_any()
                );
                warn!(%message, "Provision call failed");
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    InstanceReason::ErrorCallingProvision.as_str(),
                    &message,
                    now,
                );
                let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
                warning_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    InstanceReason::ErrorCallingProvision.as_str(),
                    actions::PROVISION,
                    message,
                )
                .await;
                Err(Error::broker("provision", e))
            }
        }
    }

    async fn update(&self, instance: ServiceInstance, checksum: String) -> Result<()> {
        let Prepared {
            resolved,
            parameters,
            context,
            ..
        } = match self.prepare(&instance).await {
            Ok(prepared) => prepared,
            Err(blocked) => return self.blocked(instance, blocked, actions::PROVISION).await,
        };

        let request = UpdateInstanceRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: Some(resolved.plan.spec.external_id.clone()),
            parameters,
            context,
        };
        info!(broker = %resolved.broker.name_any(), "Updating instance");
        let result = resolved.client.update_instance(&request).await;
        record_broker_call("update", &result);

        let now = Utc::now();
        let mut updated = instance.clone();
        let status = updated.status_or_default();
        let (ready, reason, message, error) = match result {
            Ok(response) => {
                status.set_checksum(Some(checksum));
                if response.dashboard_url.is_some() {
                    status.dashboard_url = response.dashboard_url;
                }
                if response.is_async {
                    status.begin_operation(OperationKind::Update, true, response.operation_key);
                    (
                        ConditionStatus::False,
                        InstanceReason::UpdatingInstance,
                        UPDATING_MESSAGE.to_string(),
                        None,
                    )
                } else {
                    status.begin_operation(OperationKind::Update, false, None);
                    (
                        ConditionStatus::True,
                        InstanceReason::InstanceUpdatedSuccessfully,
                        UPDATED_MESSAGE.to_string(),
                        None,
                    )
                }
            }
            Err(BrokerError::Http(http)) => {
                // Rejected for this spec revision; a later edit tries again
                status.set_checksum(Some(checksum));
                (
                    ConditionStatus::False,
                    InstanceReason::UpdateInstanceCallFailed,
                    format!("Error updating ServiceInstance: {http}"),
                    None,
                )
            }
            Err(e) => (
                ConditionStatus::False,
                InstanceReason::ErrorCallingUpdateInstance,
                format!("Error calling update on ServiceInstance: {e}"),
                Some(Error::broker("update", e)),
            ),
        };
        let is_async = status.async_op_in_progress;
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ready,
            reason.as_str(),
            &message,
            now,
        );
        let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;

        let failed = reason == InstanceReason::UpdateInstanceCallFailed || error.is_some();
        if failed {
            warn!(%reason, %message, "Instance update failed");
            warning_event(
                self.ctx.events.as_ref(),
                &stored,
                reason.as_str(),
                actions::PROVISION,
                message,
            )
            .await;
        } else {
            normal_event(
                self.ctx.events.as_ref(),
                &stored,
                reason.as_str(),
                actions::PROVISION,
                message,
            )
            .await;
        }
        if is_async {
            self.ctx
                .queues
                .polling
                .add(PollTarget::Instance(ObjectKey::of(&stored)));
        }
        error.map_or(Ok(()), Err)
    }

    async fn reconcile_deletion(&self, instance: ServiceInstance) -> Result<()> {
        if !has_finalizer(&instance) {
            return Ok(());
        }
        let status = instance.status.clone().unwrap_or_default();
        if status.checksum.is_none() {
            debug!("Instance never reached the broker, releasing");
            return remove_finalizer(self.ctx.instances.as_ref(), &instance).await;
        }
        if is_failed(&status.conditions) {
            debug!("Instance failed permanently, releasing without deprovision");
            return finish_deprovision(&self.ctx, instance).await;
        }

        let resolved = match resolve_instance(&self.ctx, &instance.spec).await {
            Ok(resolved) => resolved,
            Err(e) => return self.blocked(instance, e.into(), actions::DEPROVISION).await,
        };
        let request = DeprovisionRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: resolved.plan.spec.external_id.clone(),
        };
        info!(broker = %resolved.broker.name_any(), "Deprovisioning instance");
        let result = resolved.client.deprovision_instance(&request).await;
        record_broker_call("deprovision", &result);

        match result {
            Ok(response) if response.is_async => {
                let mut updated = instance.clone();
                let status = updated.status_or_default();
                status.begin_operation(OperationKind::Deprovision, true, response.operation_key);
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    InstanceReason::Deprovisioning.as_str(),
                    DEPROVISIONING_MESSAGE,
                    Utc::now(),
                );
                let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
                normal_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    InstanceReason::Deprovisioning.as_str(),
                    actions::DEPROVISION,
                    DEPROVISIONING_MESSAGE,
                )
                .await;
                self.ctx
                    .queues
                    .polling
                    .add(PollTarget::Instance(ObjectKey::of(&stored)));
                Ok(())
            }
            Ok(_) => finish_deprovision(&self.ctx, instance).await,
            Err(e) if e.is_gone() => {
                debug!("Broker no longer knows the instance");
                finish_deprovision(&self.ctx, instance).await
            }
            Err(e) => {
                let message = format!("Error deprovisioning ServiceInstance: {e}");
                deprovision_failed(&self.ctx, instance, &message).await?;
                Err(Error::broker("deprovision", e))
            }
        }
    }
}

#[async_trait]
impl Reconcile<ObjectKey> for InstanceReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(instance) = self.ctx.instances.get(key).await? else {
            debug!(instance = %key, "Instance no longer exists");
            return Ok(());
        };
        self.reconcile_instance(instance).await
    }
}

/// Mark the instance deprovisioned and release it
pub(crate) async fn finish_deprovision(ctx: &Context, instance: ServiceInstance) -> Result<()> {
    let mut updated = instance.clone();
    let status = updated.status_or_default();
    status.finish_async_operation();
    status.provisioned = false;
    set_condition(
        &mut status.conditions,
        ConditionType::Ready,
        ConditionStatus::False,
        InstanceReason::DeprovisionedSuccessfully.as_str(),
        DEPROVISIONED_MESSAGE,
        Utc::now(),
    );
    let stored = write_status(ctx.instances.as_ref(), &instance, updated).await?;
    remove_finalizer(ctx.instances.as_ref(), &stored).await?;
    normal_event(
        ctx.events.as_ref(),
        &stored,
        InstanceReason::DeprovisionedSuccessfully.as_str(),
        actions::DEPROVISION,
        DEPROVISIONED_MESSAGE,
    )
    .await;
    info!("Instance deprovisioned");
    Ok(())
}

/// Record that deprovisioning failed or has an unknown outcome
pub(crate) async fn deprovision_failed(
    ctx: &Context,
    instance: ServiceInstance,
    message: &str,
) -> Result<ServiceInstance> {
    warn!(%message, "Deprovision failed");
    let mut updated = instance.clone();
    let status = updated.status_or_default();
    status.finish_async_operation();
    set_condition(
        &mut status.conditions,
        ConditionType::Ready,
        ConditionStatus::Unknown,
        InstanceReason::DeprovisionCallFailed.as_str(),
        message,
        Utc::now(),
    );
    let stored = write_status(ctx.instances.as_ref(), &instance, updated).await?;
    warning_event(
        ctx.events.as_ref(),
        &stored,
        InstanceReason::DeprovisionCallFailed.as_str(),
        actions::DEPROVISION,
        message,
    )
    .await;
    Ok(stored)
}
