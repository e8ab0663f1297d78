//! ServiceBinding reconciliation
//!
//! Binds against the broker serving the binding's instance and materializes
//! the returned credentials into a secret owned by the binding. Unbinding
//! removes the broker-side binding and then the secret.

use std::sync::Arc;

use async_trait::async_trait;
use catalog_common::checksum::{binding_checksum, is_unchanged};
use catalog_common::condition::{is_failed, is_ready, set_condition};
use catalog_common::crd::{
    AsyncOperationStatus, CatalogResource, ConditionStatus, ConditionType, OperationKind,
    ServiceBinding, ServiceInstance,
};
use catalog_common::events::actions;
use catalog_common::metrics::record_broker_call;
use catalog_common::reason::BindingReason;
use catalog_common::{Error, Result};
use catalog_osb::{BindRequest, BrokerError, UnbindRequest};
use catalog_queue::Reconcile;
use chrono::Utc;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::core_client::SecretData;
use crate::instance::EMPTY_EXTERNAL_ID;
use crate::key::ObjectKey;
use crate::parameters::{parameters_map, platform_context};
use crate::poll::PollTarget;
use crate::resolver::{resolve_instance, ResolveError, Resolved};
use crate::status::{
    ensure_finalizer, has_finalizer, is_deleting, normal_event, remove_finalizer, warning_event,
    write_status,
};

pub(crate) const INJECTED_MESSAGE: &str = "Injected bind result";
pub(crate) const BINDING_MESSAGE: &str = "The binding is being created asynchronously";
pub(crate) const UNBOUND_MESSAGE: &str = "The binding was deleted successfully";
pub(crate) const UNBINDING_MESSAGE: &str = "The binding is being deleted asynchronously";

struct Blocked {
    reason: Option<BindingReason>,
    message: String,
    error: Error,
}

impl Blocked {
    fn new(reason: BindingReason, message: String, error: Error) -> Self {
        Self {
            reason: Some(reason),
            message,
            error,
        }
    }
}

impl From<ResolveError> for Blocked {
    fn from(e: ResolveError) -> Self {
        Self {
            reason: e.binding_reason(),
            message: e.to_string(),
            error: e.into_error("ServiceBinding"),
        }
    }
}

impl From<Error> for Blocked {
    fn from(error: Error) -> Self {
        Self {
            reason: None,
            message: error.to_string(),
            error,
        }
    }
}

/// Reconciler for [`ServiceBinding`] resources
pub struct BindingReconciler {
    ctx: Arc<Context>,
}

impl BindingReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, binding), fields(binding = %ObjectKey::of(&binding)))]
    pub async fn reconcile_binding(&self, binding: ServiceBinding) -> Result<()> {
        let status = binding.status.clone().unwrap_or_default();

        if status.async_op_in_progress {
            debug!("Asynchronous operation in flight, handing to poller");
            self.ctx
                .queues
                .polling
                .add_if_untracked(PollTarget::Binding(ObjectKey::of(&binding)));
            return Ok(());
        }
        if is_deleting(&binding) {
            return self.reconcile_deletion(binding).await;
        }
        if is_failed(&status.conditions) {
            debug!("Binding failed permanently, skipping");
            return Ok(());
        }
        let checksum = binding_checksum(&binding.spec);
        if is_unchanged(&checksum, status.checksum.as_deref(), false, false) {
            return Ok(());
        }

        let binding = ensure_finalizer(self.ctx.bindings.as_ref(), binding).await?;
        self.bind(binding, checksum).await
    }

    /// The bound instance and its broker, checked for bindability
    async fn prepare(
        &self,
        binding: &ServiceBinding,
    ) -> std::result::Result<(ServiceInstance, Resolved), Blocked> {
        if binding.spec.external_id.is_empty() {
            return Err(Blocked::new(
                BindingReason::ErrorValidatingSpec,
                EMPTY_EXTERNAL_ID.to_string(),
                Error::validation(ObjectKey::of(binding).to_string(), EMPTY_EXTERNAL_ID),
            ));
        }
        let Some(instance) = bound_instance(&self.ctx, binding).await? else {
            return Err(missing_instance(binding));
        };
        let instance_status = instance.status.clone().unwrap_or_default();
        if instance_status.async_op_in_progress {
            return Err(Blocked::new(
                BindingReason::ErrorAsyncOperationInProgress,
                format!(
                    "Cannot bind to ServiceInstance {:?}: an asynchronous operation is in progress",
                    binding.spec.instance_ref
                ),
                Error::in_progress(
                    ObjectKey::of(&instance).to_string(),
                    "instance operation in progress",
                ),
            ));
        }
        if !is_ready(&instance_status.conditions) {
            return Err(Blocked::new(
                BindingReason::ErrorInstanceNotReady,
                format!(
                    "Binding cannot begin because referenced ServiceInstance {:?} is not ready",
                    binding.spec.instance_ref
                ),
                Error::reference(
                    "ServiceInstance",
                    binding.spec.instance_ref.clone(),
                    "instance is not ready",
                ),
            ));
        }

        let resolved = resolve_instance(&self.ctx, &instance.spec).await?;
        let bindable = resolved
            .plan
            .spec
            .bindable
            .unwrap_or(resolved.class.spec.bindable);
        if !bindable {
            let message = format!(
                "References a non-bindable ServiceClass {:?} and ServicePlan {:?} combination",
                resolved.class.spec.external_name, resolved.plan.spec.external_name
            );
            return Err(Blocked::new(
                BindingReason::ErrorNonbindableServiceClass,
                message.clone(),
                Error::validation(ObjectKey::of(binding).to_string(), message),
            ));
        }
        Ok((instance, resolved))
    }

    async fn blocked(&self, binding: ServiceBinding, blocked: Blocked, action: &str) -> Result<()> {
        let Some(reason) = blocked.reason else {
            return Err(blocked.error);
        };
        warn!(%reason, message = %blocked.message, "Binding blocked");
        let updated = with_ready(&binding, ConditionStatus::False, reason, &blocked.message);
        let stored = write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
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

    async fn bind(&self, binding: ServiceBinding, checksum: String) -> Result<()> {
        let (instance, resolved) = match self.prepare(&binding).await {
            Ok(prepared) => prepared,
            Err(blocked) => return self.blocked(binding, blocked, actions::BIND).await,
        };
        let parameters = match parameters_map(binding.spec.parameters.as_ref()) {
            Ok(parameters) => parameters,
            Err(msg) => {
                let blocked = Blocked::new(
                    BindingReason::ErrorWithParameters,
                    format!("Error building parameters: {msg}"),
                    Error::parameters(msg),
                );
                return self.blocked(binding, blocked, actions::BIND).await;
            }
        };

        let request = BindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: resolved.plan.spec.external_id.clone(),
            parameters,
            context: platform_context(&binding.namespace().unwrap_or_default()),
        };
        info!(broker = %resolved.broker.name_any(), "Binding");
        let result = resolved.client.bind(&request).await;
        record_broker_call("bind", &result);

        match result {
            Ok(response) if response.is_async => {
                let mut updated = with_ready(
                    &binding,
                    ConditionStatus::False,
                    BindingReason::Binding,
                    BINDING_MESSAGE,
                );
                let status = updated.status_or_default();
                status.set_checksum(Some(checksum));
                status.external_bound = true;
                status.begin_operation(OperationKind::Bind, true, response.operation_key);
                let stored = write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
                normal_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    BindingReason::Binding.as_str(),
                    actions::BIND,
                    BINDING_MESSAGE,
                )
                .await;
                self.ctx
                    .queues
                    .polling
                    .add(PollTarget::Binding(ObjectKey::of(&stored)));
                Ok(())
            }
            Ok(response) => {
                let credentials = response.credentials.unwrap_or_default();
                let mut bound = binding.clone();
                bound
                    .status_or_default()
                    .begin_operation(OperationKind::Bind, false, None);
                complete_bind(&self.ctx, &binding, bound, &credentials, Some(checksum)).await
            }
            Err(BrokerError::Http(http)) => {
                let message = format!(
                    "Error creating ServiceBinding for ServiceInstance {:?} of ServiceClass {:?} at ServiceBroker {:?}: {http}",
                    binding.spec.instance_ref,
                    resolved.class.spec.external_name,
                    resolved.broker.name_any()
                );
                warn!(%message, "Broker rejected bind");
                let mut updated = with_ready(
                    &binding,
                    ConditionStatus::False,
                    BindingReason::BindCallFailed,
                    &message,
                );
                let status = updated.status_or_default();
                status.set_checksum(Some(checksum));
                set_condition(
                    &mut status.conditions,
                    ConditionType::Failed,
                    ConditionStatus::True,
                    BindingReason::BrokerReturnedFailure.as_str(),
                    &message,
                    Utc::now(),
                );
                let stored = write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
                warning_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    BindingReason::BindCallFailed.as_str(),
                    actions::BIND,
                    message,
                )
                .await;
                Ok(())
            }
            Err(e) => {
                let message = format!(
                    "Error creating ServiceBinding for ServiceInstance {:?}: {e}",
                    binding.spec.instance_ref
                );
                warn!(%message, "Bind call failed");
                let updated = with_ready(
                    &binding,
                    ConditionStatus::False,
                    BindingReason::ErrorCallingBind,
                    &message,
                );
                let stored = write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
                warning_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    BindingReason::ErrorCallingBind.as_str(),
                    actions::BIND,
                    message,
                )
                .await;
                Err(Error::broker("bind", e))
            }
        }
    }

    async fn reconcile_deletion(&self, binding: ServiceBinding) -> Result<()> {
        if !has_finalizer(&binding) {
            return Ok(());
        }
        let status = binding.status.clone().unwrap_or_default();
        if !status.external_bound {
            if status.checksum.is_none() {
                debug!("Binding never reached the broker, releasing");
                return remove_finalizer(self.ctx.bindings.as_ref(), &binding).await;
            }
            if is_failed(&status.conditions) {
                debug!("Broker rejected the binding, releasing");
                return finish_unbind(&self.ctx, binding).await;
            }
        }

        let Some(instance) = bound_instance(&self.ctx, &binding).await? else {
            info!("Bound instance is gone, releasing binding");
            return finish_unbind(&self.ctx, binding).await;
        };
        let resolved = match resolve_instance(&self.ctx, &instance.spec).await {
            Ok(resolved) => resolved,
            Err(e) => return self.blocked(binding, e.into(), actions::UNBIND).await,
        };

        let request = UnbindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: resolved.plan.spec.external_id.clone(),
        };
        info!(broker = %resolved.broker.name_any(), "Unbinding");
        let result = resolved.client.unbind(&request).await;
        record_broker_call("unbind", &result);

        match result {
            Ok(response) if response.is_async => {
                let mut updated = with_ready(
                    &binding,
                    ConditionStatus::False,
                    BindingReason::Unbinding,
                    UNBINDING_MESSAGE,
                );
                updated.status_or_default().begin_operation(
                    OperationKind::Unbind,
                    true,
                    response.operation_key,
                );
                let stored = write_status(self.ctx.bindings.as_ref(), &binding, updated).await?;
                normal_event(
                    self.ctx.events.as_ref(),
                    &stored,
                    BindingReason::Unbinding.as_str(),
                    actions::UNBIND,
                    UNBINDING_MESSAGE,
                )
                .await;
                self.ctx
                    .queues
                    .polling
                    .add(PollTarget::Binding(ObjectKey::of(&stored)));
                Ok(())
            }
            Ok(_) => finish_unbind(&self.ctx, binding).await,
            Err(e) if e.is_gone() => finish_unbind(&self.ctx, binding).await,
            Err(e) => {
                let message = format!("Error unbinding from ServiceInstance: {e}");
                unbind_failed(&self.ctx, binding, &message).await?;
                Err(Error::broker("unbind", e))
            }
        }
    }
}

#[async_trait]
impl Reconcile<ObjectKey> for BindingReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(binding) = self.ctx.bindings.get(key).await? else {
            debug!(binding = %key, "Binding no longer exists");
            return Ok(());
        };
        self.reconcile_binding(binding).await
    }
}

/// Copy of `binding` with its Ready condition set
pub(crate) fn with_ready(
    binding: &ServiceBinding,
    status: ConditionStatus,
    reason: BindingReason,
    message: &str,
) -> ServiceBinding {
    let mut updated = binding.clone();
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

/// The instance a binding references, looked up in the binding's namespace
pub(crate) async fn bound_instance(
    ctx: &Context,
    binding: &ServiceBinding,
) -> Result<Option<ServiceInstance>> {
    let key = ObjectKey::namespaced(
        binding.namespace().unwrap_or_default(),
        &binding.spec.instance_ref,
    );
    ctx.instances.get(&key).await
}

fn missing_instance(binding: &ServiceBinding) -> Blocked {
    Blocked::new(
        BindingReason::ReferencesNonexistentInstance,
        format!(
            "References a non-existent ServiceInstance {:?}",
            binding.spec.instance_ref
        ),
        Error::reference(
            "ServiceInstance",
            binding.spec.instance_ref.clone(),
            "binding references a non-existent instance",
        ),
    )
}

/// Secret contents for a set of credentials
///
/// Strings are stored as their raw bytes; any other JSON value as its JSON
/// text.
pub(crate) fn secret_data(credentials: &Map<String, Value>) -> Result<SecretData> {
    credentials
        .iter()
        .map(|(key, value)| {
            let bytes = match value {
                Value::String(s) => s.clone().into_bytes(),
                other => serde_json::to_vec(other)?,
            };
            Ok((key.clone(), bytes))
        })
        .collect()
}

/// Write credentials into the binding's secret and mark it Ready
///
/// `bound` carries the status to persist on success. The checksum is only
/// recorded once the secret exists, so a failed injection binds again; the
/// binding is marked as held by the broker either way.
pub(crate) async fn complete_bind(
    ctx: &Context,
    original: &ServiceBinding,
    bound: ServiceBinding,
    credentials: &Map<String, Value>,
    checksum: Option<String>,
) -> Result<()> {
    let namespace = original.namespace().unwrap_or_default();
    let injected = match secret_data(credentials) {
        Ok(data) => {
            ctx.core
                .apply_secret(
                    &namespace,
                    &original.spec.secret_name,
                    data,
                    original.controller_owner_ref(&()),
                )
                .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = injected {
        let message = format!(
            "Error injecting bind result into secret {:?}: {e}",
            original.spec.secret_name
        );
        warn!(%message, "Credential injection failed");
        let mut updated = with_ready(
            original,
            ConditionStatus::False,
            BindingReason::ErrorInjectingBindResult,
            &message,
        );
        updated.status_or_default().external_bound = true;
        let stored = write_status(ctx.bindings.as_ref(), original, updated).await?;
        warning_event(
            ctx.events.as_ref(),
            &stored,
            BindingReason::ErrorInjectingBindResult.as_str(),
            actions::BIND,
            message,
        )
        .await;
        return Err(e);
    }

    let mut updated = with_ready(
        &bound,
        ConditionStatus::True,
        BindingReason::InjectedBindResult,
        INJECTED_MESSAGE,
    );
    let status = updated.status_or_default();
    status.finish_async_operation();
    status.external_bound = true;
    if checksum.is_some() {
        status.set_checksum(checksum);
    }
    let stored = write_status(ctx.bindings.as_ref(), original, updated).await?;
    normal_event(
        ctx.events.as_ref(),
        &stored,
        BindingReason::InjectedBindResult.as_str(),
        actions::BIND,
        INJECTED_MESSAGE,
    )
    .await;
    info!(secret = %original.spec.secret_name, "Bind result injected");
    Ok(())
}

/// Remove the credentials secret, mark the binding unbound and release it
pub(crate) async fn finish_unbind(ctx: &Context, binding: ServiceBinding) -> Result<()> {
    let namespace = binding.namespace().unwrap_or_default();
    if let Err(e) = ctx
        .core
        .delete_secret(&namespace, &binding.spec.secret_name)
        .await
    {
        let message = format!(
            "Error deleting secret {:?}: {e}",
            binding.spec.secret_name
        );
        warn!(%message, "Credential ejection failed");
        let updated = with_ready(
            &binding,
            ConditionStatus::Unknown,
            BindingReason::ErrorEjectingBindResult,
            &message,
        );
        let stored = write_status(ctx.bindings.as_ref(), &binding, updated).await?;
        warning_event(
            ctx.events.as_ref(),
            &stored,
            BindingReason::ErrorEjectingBindResult.as_str(),
            actions::UNBIND,
            message,
        )
        .await;
        return Err(e);
    }

    let mut updated = with_ready(
        &binding,
        ConditionStatus::False,
        BindingReason::UnboundSuccessfully,
        UNBOUND_MESSAGE,
    );
    let status = updated.status_or_default();
    status.finish_async_operation();
    status.external_bound = false;
    let stored = write_status(ctx.bindings.as_ref(), &binding, updated).await?;
    remove_finalizer(ctx.bindings.as_ref(), &stored).await?;
    normal_event(
        ctx.events.as_ref(),
        &stored,
        BindingReason::UnboundSuccessfully.as_str(),
        actions::UNBIND,
        UNBOUND_MESSAGE,
    )
    .await;
    info!("Binding released");
    Ok(())
}

/// Record that unbinding failed or has an unknown outcome
pub(crate) async fn unbind_failed(
    ctx: &Context,
    binding: ServiceBinding,
    message: &str,
) -> Result<ServiceBinding> {
    warn!(%message, "Unbind failed");
    let mut updated = with_ready(
        &binding,
        ConditionStatus::Unknown,
        BindingReason::UnbindCallFailed,
        message,
    );
    updated.status_or_default().finish_async_operation();
    let stored = write_status(ctx.bindings.as_ref(), &binding, updated).await?;
    warning_event(
        ctx.events.as_ref(),
        &stored,
        BindingReason::UnbindCallFailed.as_str(),
        actions::UNBIND,
        message,
    )
    .await;
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_client::MockCoreClient;
    use crate::test_support::{Harness, NAMESPACE};
    use catalog_common::condition::find_condition;
    use catalog_common::crd::ServiceBindingStatus;
    use catalog_osb::fake::Action;
    use catalog_osb::{BindResponse, UnbindResponse};
    use serde_json::json;

    fn ready(status: &ServiceBindingStatus) -> (ConditionStatus, String) {
        let c = find_condition(&status.conditions, ConditionType::Ready).unwrap();
        (c.status, c.reason.clone())
    }

    async fn status(h: &Harness, name: &str) -> ServiceBindingStatus {
        h.binding(name)
            .await
            .and_then(|b| b.status)
            .unwrap_or_default()
    }

    async fn reconcile(h: &Harness, name: &str) -> Result<()> {
        let binding = h.binding(name).await.unwrap();
        BindingReconciler::new(h.ctx.clone())
            .reconcile_binding(binding)
            .await
    }

    fn credentials() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("username".to_string(), json!("admin"));
        map.insert("port".to_string(), json!(3306));
        map
    }

    async fn bound(h: &Harness) {
        h.seed_catalog().await;
        h.ready_instance("db").await;
        h.create_binding("creds", "db").await;
        h.broker.set_bind(Ok(BindResponse {
            is_async: false,
            credentials: Some(credentials()),
            operation_key: None,
        }));
        reconcile(h, "creds").await.unwrap();
        h.broker.clear_actions();
    }

    #[test]
    fn strings_are_raw_and_other_values_are_json() {
        let data = secret_data(&credentials()).unwrap();
        assert_eq!(data["username"], b"admin".to_vec());
        assert_eq!(data["port"], b"3306".to_vec());
    }

    mod bind {
        use super::*;

        #[tokio::test]
        async fn sync_bind_injects_credentials() {
            let h = Harness::new();
            bound(&h).await;

            let binding = h.binding("creds").await.unwrap();
            let status = binding.status.clone().unwrap();
            assert_eq!(
                ready(&status),
                (ConditionStatus::True, "InjectedBindResult".to_string())
            );
            assert_eq!(status.checksum, Some(binding_checksum(&binding.spec)));
            assert!(has_finalizer(&binding));

            let secret = h.core.secret(NAMESPACE, "creds-creds").unwrap();
            assert_eq!(secret["username"], b"admin".to_vec());
            let owner = h.core.secret_owner(NAMESPACE, "creds-creds").unwrap();
            assert_eq!(owner.kind, "ServiceBinding");
            assert_eq!(owner.name, "creds");

            reconcile(&h, "creds").await.unwrap();
            assert!(h.broker.actions().is_empty(), "unchanged binding is not rebound");
        }

        #[tokio::test]
        async fn empty_external_id_is_rejected_before_the_broker() {
            let h = Harness::new();
            h.seed_catalog().await;
            h.ready_instance("db").await;
            let mut binding = h.create_binding("creds", "db").await;
            binding.spec.external_id = String::new();
            h.ctx.bindings.update(&binding).await.unwrap();

            let err = reconcile(&h, "creds").await.unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{err}");
            assert!(h.broker.actions().is_empty());
            let status = status(&h, "creds").await;
            assert_eq!(
                ready(&status),
                (ConditionStatus::False, "ErrorValidatingSpec".to_string())
            );
            assert!(!status.external_bound);
            assert!(h.core.secret(NAMESPACE, "creds-creds").is_none());
        }

        #[tokio::test]
        async fn bind_request_names_instance_and_plan() {
            let h = Harness::new();
            h.seed_catalog().await;
            let instance = h.ready_instance("db").await;
            let binding = h.create_binding("creds", "db").await;

            reconcile(&h, "creds").await.unwrap();

            let actions = h.broker.actions();
            let [Action::Bind(request)] = actions.as_slice() else {
                panic!("expected one bind, got {actions:?}");
            };
            assert_eq!(request.binding_id, binding.spec.external_id);
            assert_eq!(request.instance_id, instance.spec.external_id);
            assert_eq!(request.service_id, "mysql-id");
            assert_eq!(request.plan_id, "small-id");
            assert!(request.accepts_incomplete);
        }

        #[tokio::test]
        async fn missing_instance_blocks_bind() {
            let h = Harness::new();
            h.create_binding("creds", "db").await;

            reconcile(&h, "creds").await.unwrap_err();
            assert_eq!(
                ready(&status(&h, "creds").await).1,
                "ReferencesNonexistentInstance"
            );
            assert_eq!(h.event_reasons(), vec!["ReferencesNonexistentInstance"]);
        }

        #[tokio::test]
        async fn instance_not_ready_blocks_bind() {
            let h = Harness::new();
            h.seed_catalog().await;
            h.create_instance("db").await;
            h.create_binding("creds", "db").await;

            let err = reconcile(&h, "creds").await.unwrap_err();
            assert!(err.is_retryable());
            assert_eq!(ready(&status(&h, "creds").await).1, "ErrorInstanceNotReady");
            assert!(h.broker.actions().is_empty());
        }

        #[tokio::test]
        async fn instance_operation_in_progress_blocks_bind() {
            let h = Harness::new();
            h.seed_catalog().await;
            let instance = h.ready_instance("db").await;
            let mut busy = instance.status.clone().unwrap();
            busy.async_op_in_progress = true;
            h.set_instance_status(instance, busy).await;
            h.create_binding("creds", "db").await;

            reconcile(&h, "creds").await.unwrap_err();
            assert_eq!(
                ready(&status(&h, "creds").await).1,
                "ErrorAsyncOperationInProgress"
            );
        }

        #[tokio::test]
        async fn non_bindable_plan_blocks_bind() {
            let h = Harness::new();
            h.seed_catalog().await;
            let mut plan = h
                .ctx
                .plans
                .get(&ObjectKey::cluster("small-id"))
                .await
                .unwrap()
                .unwrap();
            plan.spec.bindable = Some(false);
            h.ctx.plans.update(&plan).await.unwrap();
            h.ready_instance("db").await;
            h.create_binding("creds", "db").await;

            let err = reconcile(&h, "creds").await.unwrap_err();
            assert!(!err.is_retryable());
            assert_eq!(
                ready(&status(&h, "creds").await).1,
                "ErrorNonbindableServiceClass"
            );
            assert!(h.broker.actions().is_empty());
        }

        #[tokio::test]
        async fn non_object_parameters_block_bind() {
            let h = Harness::new();
            h.seed_catalog().await;
            h.ready_instance("db").await;
            let mut binding = h.create_binding("creds", "db").await;
            binding.spec.parameters = Some(json!("oops"));
            h.ctx.bindings.update(&binding).await.unwrap();

            reconcile(&h, "creds").await.unwrap_err();
            assert_eq!(ready(&status(&h, "creds").await).1, "ErrorWithParameters");
        }

        #[tokio::test]
        async fn broker_rejection_fails_binding() {
            let h = Harness::new();
            h.seed_catalog().await;
            h.ready_instance("db").await;
            h.create_binding("creds", "db").await;
            h.broker.set_bind(Err(BrokerError::status(409)));

            reconcile(&h, "creds").await.unwrap();

            let status = status(&h, "creds").await;
            assert!(is_failed(&status.conditions));
            assert_eq!(ready(&status).1, "BindCallFailed");
            assert!(h.core.secret(NAMESPACE, "creds-creds").is_none());
        }

        #[tokio::test]
        async fn transport_error_is_retried() {
            let h = Harness::new();
            h.seed_catalog().await;
            h.ready_instance("db").await;
            h.create_binding("creds", "db").await;
            h.broker.set_bind(Err(BrokerError::transport("timeout")));

            let err = reconcile(&h, "creds").await.unwrap_err();
            assert!(err.is_retryable());
            assert_eq!(ready(&status(&h, "creds").await).1, "ErrorCallingBind");
        }

        #[tokio::test]
        async fn async_bind_is_handed_to_poller() {
            let h = Harness::new();
            h.seed_catalog().await;
            h.ready_instance("db").await;
            h.create_binding("creds", "db").await;
            h.broker.set_bind(Ok(BindResponse {
                is_async: true,
                credentials: None,
                operation_key: Some("bind-op".to_string()),
            }));

            reconcile(&h, "creds").await.unwrap();

            let status = status(&h, "creds").await;
            assert!(status.async_op_in_progress);
            assert_eq!(status.current_operation, Some(OperationKind::Bind));
            assert_eq!(status.last_operation.as_deref(), Some("bind-op"));
            assert_eq!(ready(&status).1, "Binding");
            assert_eq!(h.ctx.queues.polling.len(), 1);
        }

        #[tokio::test]
        async fn failed_injection_is_unbound_on_delete() {
            let mut core = MockCoreClient::new();
            core.expect_apply_secret()
                .times(1)
                .returning(|_, _, _, _| Err(Error::internal("secrets", "apiserver unavailable")));
            core.expect_delete_secret()
                .times(1)
                .returning(|_, _| Ok(()));
            let h = Harness::with_core_client(Arc::new(core));
            h.seed_catalog().await;
            h.ready_instance("db").await;
            h.create_binding("creds", "db").await;
            h.broker.set_bind(Ok(BindResponse {
                is_async: false,
                credentials: Some(credentials()),
                operation_key: None,
            }));

            reconcile(&h, "creds").await.unwrap_err();

            let status = status(&h, "creds").await;
            assert_eq!(ready(&status).1, "ErrorInjectingBindResult");
            assert_eq!(status.checksum, None, "injection is retried by binding again");
            assert!(status.external_bound);

            h.broker.clear_actions();
            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap();

            assert!(h.binding("creds").await.is_none());
            let actions = h.broker.actions();
            assert!(
                matches!(actions.as_slice(), [Action::Unbind(_)]),
                "expected an unbind, got {actions:?}"
            );
        }
    }

    mod unbind {
        use super::*;

        #[tokio::test]
        async fn deletion_unbinds_and_removes_secret() {
            let h = Harness::new();
            bound(&h).await;

            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap();

            assert!(h.binding("creds").await.is_none());
            assert!(h.core.secret(NAMESPACE, "creds-creds").is_none());
            let actions = h.broker.actions();
            assert!(matches!(actions.as_slice(), [Action::Unbind(r)] if r.plan_id == "small-id"));
            assert!(h
                .event_reasons()
                .contains(&"UnboundSuccessfully".to_string()));
        }

        #[tokio::test]
        async fn gone_binding_counts_as_unbound() {
            let h = Harness::new();
            bound(&h).await;
            h.broker.set_unbind(Err(BrokerError::status(410)));

            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap();
            assert!(h.binding("creds").await.is_none());
        }

        #[tokio::test]
        async fn unbind_error_keeps_finalizer() {
            let h = Harness::new();
            bound(&h).await;
            h.broker.set_unbind(Err(BrokerError::status(500)));

            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap_err();

            let binding = h.binding("creds").await.unwrap();
            assert!(has_finalizer(&binding));
            assert_eq!(
                ready(&binding.status.unwrap()),
                (ConditionStatus::Unknown, "UnbindCallFailed".to_string())
            );
            assert!(h.core.secret(NAMESPACE, "creds-creds").is_some());
        }

        #[tokio::test]
        async fn async_unbind_is_handed_to_poller() {
            let h = Harness::new();
            bound(&h).await;
            h.broker.set_unbind(Ok(UnbindResponse {
                is_async: true,
                operation_key: Some("unbind-op".to_string()),
            }));

            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap();

            let status = status(&h, "creds").await;
            assert_eq!(status.current_operation, Some(OperationKind::Unbind));
            assert_eq!(ready(&status).1, "Unbinding");
            assert_eq!(h.ctx.queues.polling.len(), 1);
        }

        #[tokio::test]
        async fn orphaned_binding_is_released_locally() {
            let h = Harness::new();
            bound(&h).await;
            let mut instance = h.instance("db").await.unwrap();
            instance.metadata.finalizers = None;
            h.ctx.instances.update(&instance).await.unwrap();
            h.delete_instance("db").await;

            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap();

            assert!(h.binding("creds").await.is_none());
            assert!(h.broker.actions().is_empty());
        }

        #[tokio::test]
        async fn rejected_binding_is_released_without_broker_call() {
            let h = Harness::new();
            h.seed_catalog().await;
            h.ready_instance("db").await;
            h.create_binding("creds", "db").await;
            h.broker.set_bind(Err(BrokerError::status(400)));
            reconcile(&h, "creds").await.unwrap();
            assert!(!status(&h, "creds").await.external_bound);
            h.broker.clear_actions();

            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap();

            assert!(h.binding("creds").await.is_none());
            assert!(h.broker.actions().is_empty());
        }

        #[tokio::test]
        async fn never_bound_binding_is_released_without_broker_call() {
            let h = Harness::new();
            let binding = h.create_binding("creds", "db").await;
            ensure_finalizer(h.ctx.bindings.as_ref(), binding)
                .await
                .unwrap();

            h.delete_binding("creds").await;
            reconcile(&h, "creds").await.unwrap();

            assert!(h.binding("creds").await.is_none());
            assert!(h.broker.actions().is_empty());
        }
    }
}
