//! Fixtures shared by reconciler tests

use std::sync::Arc;

use catalog_common::checksum::instance_checksum;
use catalog_common::condition::set_condition;
use catalog_common::crd::{
    ConditionStatus, ConditionType, RelistBehavior, ServiceBinding, ServiceBindingSpec,
    ServiceBroker, ServiceBrokerSpec, ServiceClass, ServiceClassSpec, ServiceInstance,
    ServiceInstanceSpec, ServiceInstanceStatus, ServicePlan, ServicePlanSpec,
};
use catalog_common::events::RecordingEventPublisher;
use catalog_osb::fake::{FakeBrokerClient, FakeBrokerClientFactory};
use chrono::Utc;

use crate::context::Context;
use crate::core_client::CoreClient;
use crate::key::ObjectKey;
use crate::memory::MemoryCoreClient;

pub(crate) const NAMESPACE: &str = "default";

pub(crate) struct Harness {
    pub ctx: Arc<Context>,
    pub broker: Arc<FakeBrokerClient>,
    pub factory: Arc<FakeBrokerClientFactory>,
    pub core: Arc<MemoryCoreClient>,
    pub events: Arc<RecordingEventPublisher>,
}

impl Harness {
    pub fn new() -> Self {
        let broker = Arc::new(FakeBrokerClient::new());
        let factory = Arc::new(FakeBrokerClientFactory::new(broker.clone()));
        let core = Arc::new(MemoryCoreClient::new());
        core.add_namespace(NAMESPACE);
        let events = Arc::new(RecordingEventPublisher::new());
        let ctx = Arc::new(Context::for_testing(
            core.clone(),
            factory.clone(),
            events.clone(),
        ));
        Self {
            ctx,
            broker,
            factory,
            core,
            events,
        }
    }

    /// Harness whose context uses `core` instead of the in-memory core client
    pub fn with_core_client(core: Arc<dyn CoreClient>) -> Self {
        let mut h = Self::new();
        h.ctx = Arc::new(Context::for_testing(
            core,
            h.factory.clone(),
            h.events.clone(),
        ));
        h
    }

    /// Broker `broker` offering class `mysql` with plan `small`
    pub async fn seed_catalog(&self) -> ServiceBroker {
        let created = self.ctx.brokers.create(&broker("broker")).await.unwrap();
        self.ctx
            .classes
            .create(&class("broker", "mysql"))
            .await
            .unwrap();
        self.ctx
            .plans
            .create(&plan("broker", "mysql", "small"))
            .await
            .unwrap();
        created
    }

    pub async fn create_instance(&self, name: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(name, ServiceInstanceSpec::new("mysql", "small"));
        instance.metadata.namespace = Some(NAMESPACE.to_string());
        self.ctx.instances.create(&instance).await.unwrap()
    }

    /// Instance the broker already provisioned, Ready and idle
    pub async fn ready_instance(&self, name: &str) -> ServiceInstance {
        let created = self.create_instance(name).await;
        let mut status = ServiceInstanceStatus {
            checksum: Some(instance_checksum(&created.spec)),
            provisioned: true,
            ..Default::default()
        };
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            "ProvisionedSuccessfully",
            "ready",
            Utc::now(),
        );
        self.set_instance_status(created, status).await
    }

    pub async fn set_instance_status(
        &self,
        mut instance: ServiceInstance,
        status: ServiceInstanceStatus,
    ) -> ServiceInstance {
        instance.status = Some(status);
        self.ctx.instances.update_status(&instance).await.unwrap()
    }

    pub async fn instance(&self, name: &str) -> Option<ServiceInstance> {
        self.ctx
            .instances
            .get(&ObjectKey::namespaced(NAMESPACE, name))
            .await
            .unwrap()
    }

    pub async fn instance_status(&self, name: &str) -> ServiceInstanceStatus {
        self.instance(name)
            .await
            .and_then(|i| i.status)
            .unwrap_or_default()
    }

    pub async fn delete_instance(&self, name: &str) {
        self.ctx
            .instances
            .delete(&ObjectKey::namespaced(NAMESPACE, name))
            .await
            .unwrap();
    }

    pub async fn create_binding(&self, name: &str, instance: &str) -> ServiceBinding {
        let mut binding =
            ServiceBinding::new(name, ServiceBindingSpec::new(instance, format!("{name}-creds")));
        binding.metadata.namespace = Some(NAMESPACE.to_string());
        self.ctx.bindings.create(&binding).await.unwrap()
    }

    pub async fn binding(&self, name: &str) -> Option<ServiceBinding> {
        self.ctx
            .bindings
            .get(&ObjectKey::namespaced(NAMESPACE, name))
            .await
            .unwrap()
    }

    pub async fn delete_binding(&self, name: &str) {
        self.ctx
            .bindings
            .delete(&ObjectKey::namespaced(NAMESPACE, name))
            .await
            .unwrap();
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events.reasons()
    }
}

pub(crate) fn broker(name: &str) -> ServiceBroker {
    ServiceBroker::new(
        name,
        ServiceBrokerSpec {
            url: format!("https://{name}.example"),
            auth_info: None,
            insecure_skip_tls_verify: false,
            ca_bundle: None,
            relist_behavior: RelistBehavior::Duration,
            relist_duration_seconds: None,
            relist_requests: 0,
        },
    )
}

/// Class named and identified `{external_name}-id`
pub(crate) fn class(broker: &str, external_name: &str) -> ServiceClass {
    ServiceClass::new(
        &format!("{external_name}-id"),
        ServiceClassSpec {
            broker_name: broker.to_string(),
            external_id: format!("{external_name}-id"),
            external_name: external_name.to_string(),
            description: String::new(),
            bindable: true,
            plan_updatable: true,
            tags: vec![],
            requires: vec![],
            external_metadata: None,
        },
    )
}

/// Plan named and identified `{external_name}-id`
pub(crate) fn plan(broker: &str, class_external_name: &str, external_name: &str) -> ServicePlan {
    ServicePlan::new(
        &format!("{external_name}-id"),
        ServicePlanSpec {
            broker_name: broker.to_string(),
            service_class_ref: format!("{class_external_name}-id"),
            external_id: format!("{external_name}-id"),
            external_name: external_name.to_string(),
            description: String::new(),
            free: Some(true),
            bindable: None,
            external_metadata: None,
            instance_create_parameter_schema: None,
            instance_update_parameter_schema: None,
            binding_create_parameter_schema: None,
        },
    )
}
