//! Last-operation polling for asynchronous broker operations
//!
//! Instances and bindings with `asyncOpInProgress` are polled from a single
//! queue whose backoff starts at the polling interval. An operation still in
//! progress is reported as an error so the queue keeps backing off; a
//! terminal state clears the flag and the key is forgotten.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use catalog_common::condition::set_condition;
use catalog_common::crd::{
    AsyncOperationStatus, CatalogResource, ConditionStatus, ConditionType, OperationKind,
    ServiceInstance,
};
use catalog_common::events::actions;
use catalog_common::metrics::record_broker_call;
use catalog_common::reason::{BindingReason, InstanceReason};
use catalog_common::{Error, Result};
use catalog_osb::{
    BindingLastOperationRequest, GetBindingRequest, LastOperationRequest, LastOperationState,
};
use catalog_queue::Reconcile;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::binding::{
    bound_instance, complete_bind, finish_unbind, unbind_failed, with_ready, BINDING_MESSAGE,
    UNBINDING_MESSAGE,
};
use crate::context::Context;
use crate::instance::{
    deprovision_failed, finish_deprovision, DEPROVISIONING_MESSAGE, PROVISIONED_MESSAGE,
    PROVISIONING_MESSAGE, UPDATED_MESSAGE, UPDATING_MESSAGE,
};
use crate::key::ObjectKey;
use crate::resolver::resolve_instance;
use crate::status::{is_deleting, normal_event, warning_event, write_status};

/// A resource awaiting the outcome of an asynchronous broker operation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PollTarget {
    Instance(ObjectKey),
    Binding(ObjectKey),
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(key) => write!(f, "instance:{key}"),
            Self::Binding(key) => write!(f, "binding:{key}"),
        }
    }
}

/// Reconciler for the polling queue
pub struct PollReconciler {
    ctx: Arc<Context>,
}

impl PollReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(instance = %key))]
    pub async fn poll_instance(&self, key: &ObjectKey) -> Result<()> {
        let Some(instance) = self.ctx.instances.get(key).await? else {
            debug!("Instance no longer exists, nothing to poll");
            return Ok(());
        };
        let status = instance.status.clone().unwrap_or_default();
        if !status.async_op_in_progress {
            debug!("No asynchronous operation in flight");
            return Ok(());
        }
        let operation = match status.current_operation {
            Some(
                op @ (OperationKind::Provision | OperationKind::Update | OperationKind::Deprovision),
            ) => op,
            _ if is_deleting(&instance) => OperationKind::Deprovision,
            _ => OperationKind::Provision,
        };

        let resolved = match resolve_instance(&self.ctx, &instance.spec).await {
            Ok(resolved) => resolved,
            Err(e) => {
                if let Some(reason) = e.instance_reason() {
                    let message = format!("Error polling last operation: {e}");
                    warn!(%reason, %message, "Cannot resolve references while polling");
                    let updated =
                        instance_ready(&instance, ConditionStatus::Unknown, reason, &message);
                    let stored =
                        write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
                    warning_event(
                        self.ctx.events.as_ref(),
                        &stored,
                        reason.as_str(),
                        actions::POLL,
                        message,
                    )
                    .await;
                }
                return Err(e.into_error("ServiceInstance"));
            }
        };
        let request = LastOperationRequest {
            instance_id: instance.spec.external_id.clone(),
            service_id: Some(resolved.class.spec.external_id.clone()),
            plan_id: Some(resolved.plan.spec.external_id.clone()),
            operation_key: status.last_operation.clone(),
        };
        let result = resolved.client.poll_last_operation(&request).await;
        record_broker_call("poll", &result);

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_gone() && operation == OperationKind::Deprovision => {
                debug!("Broker no longer knows the instance");
                return finish_deprovision(&self.ctx, instance).await;
            }
            Err(e) => {
                let message = format!("Error polling last operation: {e}");
                warn!(%message, "Poll failed");
                warning_event(
                    self.ctx.events.as_ref(),
                    &instance,
                    InstanceReason::ErrorPollingLastOperation.as_str(),
                    actions::POLL,
                    message,
                )
                .await;
                return Err(Error::broker("poll last operation", e));
            }
        };
        let description = response.description.unwrap_or_default();
        debug!(state = %response.state, %description, ?operation, "Polled last operation");

        match response.state {
            LastOperationState::InProgress => {
                let (reason, default_message) = match operation {
                    OperationKind::Update => (InstanceReason::UpdatingInstance, UPDATING_MESSAGE),
                    OperationKind::Deprovision => {
                        (InstanceReason::Deprovisioning, DEPROVISIONING_MESSAGE)
                    }
                    _ => (InstanceReason::Provisioning, PROVISIONING_MESSAGE),
                };
                let message = if description.is_empty() {
                    default_message.to_string()
                } else {
                    format!("{default_message}: {description}")
                };
                let updated = instance_ready(&instance, ConditionStatus::False, reason, &message);
                write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
                Err(Error::in_progress(key.to_string(), description))
            }
            LastOperationState::Succeeded => match operation {
                OperationKind::Deprovision => finish_deprovision(&self.ctx, instance).await,
                OperationKind::Update => {
                    self.instance_succeeded(
                        instance,
                        InstanceReason::InstanceUpdatedSuccessfully,
                        UPDATED_MESSAGE,
                    )
                    .await
                }
                _ => {
                    self.instance_succeeded(
                        instance,
                        InstanceReason::ProvisionedSuccessfully,
                        PROVISIONED_MESSAGE,
                    )
                    .await
                }
            },
            LastOperationState::Failed => {
                let message = format!("{operation:?} failed at the broker: {description}");
                if operation == OperationKind::Deprovision {
                    deprovision_failed(&self.ctx, instance, &message).await?;
                    return Ok(());
                }
                let reason = if operation == OperationKind::Update {
                    InstanceReason::UpdateInstanceCallFailed
                } else {
                    InstanceReason::ProvisionCallFailed
                };
                warn!(%reason, %message, "Asynchronous operation failed");
                let mut updated =
                    instance_ready(&instance, ConditionStatus::False, reason, &message);
                updated.status_or_default().finish_async_operation();
                let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
                warning_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    reason.as_str(),
                    actions::POLL,
                    message,
                )
                .await;
                Ok(())
            }
            LastOperationState::Unrecognized(state) => {
                let message = format!("Broker reported unrecognized operation state {state:?}");
                warn!(%message, "Poll returned unknown state");
                warning_event(
                    self.ctx.events.as_ref(),
                    &instance,
                    InstanceReason::ErrorPollingLastOperation.as_str(),
                    actions::POLL,
                    message.clone(),
                )
                .await;
                Err(Error::internal("poll", message))
            }
        }
    }

    async fn instance_succeeded(
        &self,
        instance: ServiceInstance,
        reason: InstanceReason,
        message: &str,
    ) -> Result<()> {
        let mut updated = instance_ready(&instance, ConditionStatus::True, reason, message);
        let status = updated.status_or_default();
        status.finish_async_operation();
        status.provisioned = true;
        let stored = write_status(self.ctx.instances.as_ref(), &instance, updated).await?;
        normal_event(
            self.ctx.events.as_ref(),
            &stored,
            reason.as_str(),
            actions::POLL,
            message,
        )
        .await;
        info!(%reason, "Asynchronous operation completed");
        Ok(())
    }

    #[instrument(skip(self), fields(binding = %key))]
    pub async fn poll_binding(&self, key: &ObjectKey) -> Result<()> {
        let Some(binding) = self.ctx.bindings.get(key).await? else {
            debug!("Binding no longer exists, nothing to poll");
            return Ok(());
        };
        let status = binding.status.clone().unwrap_or_default();
        if !status.async_op_in_progress {
            return Ok(());
        }
        let operation = match status.current_operation {
            Some(op @ (OperationKind::Bind | OperationKind::Unbind)) => op,
            _ if is_deleting(&binding) => OperationKind::Unbind,
            _ => OperationKind::Bind,
        };

        let Some(instance) = bound_instance(&self.ctx, &binding).await? else {
            if operation == OperationKind::Unbind {
                return finish_unbind(&self.ctx, binding).await;
            }
            return Err(Error::reference(
                "ServiceInstance",
                binding.spec.instance_ref.clone(),
                "bound instance no longer exists",
            ));
        };
        let resolved = match resolve_instance(&self.ctx, &instance.spec).await {
            Ok(resolved) => resolved,
            Err(e) => {
                if let Some(reason) = e.binding_reason() {
                    let message = format!("Error polling last operation: {e}");
                    warn!(%reason, %message, "Cannot resolve references while polling");
                    let updated = with_ready(&binding, ConditionStatus::Unknown, reason, &message);
                    let stored =
                        write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
                    warning_event(
                        self.ctx.events.as_ref(),
                        &stored,
                        reason.as_str(),
                        actions::POLL,
                        message,
                    )
                    .await;
                }
                return Err(e.into_error("ServiceBinding"));
            }
        };
        let request = BindingLastOperationRequest {
            instance_id: instance.spec.external_id.clone(),
            binding_id: binding.spec.external_id.clone(),
            service_id: Some(resolved.class.spec.external_id.clone()),
            plan_id: Some(resolved.plan.spec.external_id.clone()),
            operation_key: status.last_operation.clone(),
        };
        let result = resolved.client.poll_binding_last_operation(&request).await;
        record_broker_call("poll_binding", &result);

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_gone() && operation == OperationKind::Unbind => {
                return finish_unbind(&self.ctx, binding).await;
            }
            Err(e) => {
                let message = format!("Error polling last operation: {e}");
                warn!(%message, "Poll failed");
                warning_event(
                    self.ctx.events.as_ref(),
                    &binding,
                    BindingReason::ErrorPollingLastOperation.as_str(),
                    actions::POLL,
                    message,
                )
                .await;
                return Err(Error::broker("poll binding last operation", e));
            }
        };
        let description = response.description.unwrap_or_default();
        debug!(state = %response.state, %description, ?operation, "Polled last operation");

        match (response.state, operation) {
            (LastOperationState::InProgress, _) => {
                let (reason, default_message) = if operation == OperationKind::Unbind {
                    (BindingReason::Unbinding, UNBINDING_MESSAGE)
                } else {
                    (BindingReason::Binding, BINDING_MESSAGE)
                };
                let message = if description.is_empty() {
                    default_message.to_string()
                } else {
                    format!("{default_message}: {description}")
                };
                let updated = with_ready(&binding, ConditionStatus::False, reason, &message);
                write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
                Err(Error::in_progress(key.to_string(), description))
            }
            (LastOperationState::Succeeded, OperationKind::Unbind) => {
                finish_unbind(&self.ctx, binding).await
            }
            (LastOperationState::Succeeded, _) => {
                let fetched = resolved
                    .client
                    .get_binding(&GetBindingRequest {
                        instance_id: instance.spec.external_id.clone(),
                        binding_id: binding.spec.external_id.clone(),
                    })
                    .await;
                record_broker_call("get_binding", &fetched);
                let credentials = match fetched {
                    Ok(response) => response.credentials,
                    Err(e) => {
                        let message = format!("Error fetching binding after asynchronous bind: {e}");
                        warning_event(
                            self.ctx.events.as_ref(),
                            &binding,
                            BindingReason::ErrorPollingLastOperation.as_str(),
                            actions::POLL,
                            message,
                        )
                        .await;
                        return Err(Error::broker("get binding", e));
                    }
                };
                let mut bound = binding.clone();
                bound.status_or_default().finish_async_operation();
                complete_bind(&self.ctx, &binding, bound, &credentials, None).await
            }
            (LastOperationState::Failed, OperationKind::Unbind) => {
                let message = format!("Unbind failed at the broker: {description}");
                unbind_failed(&self.ctx, binding, &message).await?;
                Ok(())
            }
            (LastOperationState::Failed, _) => {
                let message = format!("Bind failed at the broker: {description}");
                warn!(%message, "Asynchronous bind failed");
                let mut updated = with_ready(
                    &binding,
                    ConditionStatus::False,
                    BindingReason::BindCallFailed,
                    &message,
                );
                updated.status_or_default().finish_async_operation();
                let stored = write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
                warning_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    BindingReason::BindCallFailed.as_str(),
                    actions::POLL,
                    message,
                )
                .await;
                Ok(())
            }
            (LastOperationState::Unrecognized(state), _) => {
                let message = format!("Broker reported unrecognized operation state {state:?}");
                warning_event(
                    self.ctx.events.as_ref(),
                    &binding,
                    BindingReason::ErrorPollingLastOperation.as_str(),
                    actions::POLL,
                    message.clone(),
                )
                .await;
                Err(Error::internal("poll", message))
            }
        }
    }
}

#[async_trait]
impl Reconcile<PollTarget> for PollReconciler {
    async fn reconcile(&self, target: &PollTarget) -> Result<()> {
        match target {
            PollTarget::Instance(key) => self.poll_instance(key).await,
            PollTarget::Binding(key) => self.poll_binding(key).await,
        }
    }
}

fn instance_ready(
    instance: &ServiceInstance,
    status: ConditionStatus,
    reason: InstanceReason,
    message: &str,
) -> ServiceInstance {
    let mut updated = instance.clone();
    set_condition(
        updated.status_or_default().conditions_mut(),
        ConditionType::Ready,
        status,
        reason.as_str(),
        message,
        Utc::now(),
    );
    updated
}
