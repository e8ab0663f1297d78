//! Custom Resource Definitions for the service catalog
//!
//! Brokers, classes and plans are cluster-scoped; instances and bindings are
//! namespaced. [`CatalogResource`] gives generic code (stores, the controller
//! manager) uniform access to spec and status.

mod binding;
mod broker;
mod class;
mod instance;
mod plan;
mod types;

pub use binding::{ServiceBinding, ServiceBindingSpec, ServiceBindingStatus};
pub use broker::{
    BrokerAuthInfo, RelistBehavior, SecretAuth, ServiceBroker, ServiceBrokerSpec,
    ServiceBrokerStatus,
};
pub use class::{ServiceClass, ServiceClassSpec, ServiceClassStatus};
pub use instance::{ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus};
pub use plan::{ServicePlan, ServicePlanSpec, ServicePlanStatus};
pub use types::{Condition, ConditionStatus, ConditionType, OperationKind, SecretReference};

use std::fmt::Debug;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Generate a broker-facing identifier for a new instance or binding
pub fn new_external_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Every CRD the controller needs installed
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ServiceBroker::crd(),
        ServiceClass::crd(),
        ServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ]
}

/// Uniform spec/status access over the catalog kinds
pub trait CatalogResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Desired state type
    type Spec: Clone + Debug + PartialEq + Send + Sync;
    /// Observed state type
    type Status: Clone + Debug + Default + PartialEq + Send + Sync;

    /// Short lowercase label used in logs and metrics
    const LABEL: &'static str;

    /// Desired state
    fn spec(&self) -> &Self::Spec;
    /// Mutable desired state
    fn spec_mut(&mut self) -> &mut Self::Spec;
    /// Observed state, if any has been written
    fn status(&self) -> Option<&Self::Status>;
    /// Mutable observed state
    fn status_mut(&mut self) -> &mut Option<Self::Status>;

    /// Observed state, creating a default one if absent
    fn status_or_default(&mut self) -> &mut Self::Status {
        self.status_mut().get_or_insert_with(Default::default)
    }
}

macro_rules! catalog_resource {
    ($kind:ty, $spec:ty, $status:ty, $label:literal) => {
        impl CatalogResource for $kind {
            type Spec = $spec;
            type Status = $status;

            const LABEL: &'static str = $label;

            fn spec(&self) -> &Self::Spec {
                &self.spec
            }

            fn spec_mut(&mut self) -> &mut Self::Spec {
                &mut self.spec
            }

            fn status(&self) -> Option<&Self::Status> {
                self.status.as_ref()
            }

            fn status_mut(&mut self) -> &mut Option<Self::Status> {
                &mut self.status
            }
        }
    };
}

catalog_resource!(ServiceBroker, ServiceBrokerSpec, ServiceBrokerStatus, "broker");
catalog_resource!(ServiceClass, ServiceClassSpec, ServiceClassStatus, "class");
catalog_resource!(ServicePlan, ServicePlanSpec, ServicePlanStatus, "plan");
catalog_resource!(ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus, "instance");
catalog_resource!(ServiceBinding, ServiceBindingSpec, ServiceBindingStatus, "binding");

/// Bookkeeping shared by statuses that track asynchronous broker operations
pub trait AsyncOperationStatus {
    /// Conditions on the status
    fn conditions(&self) -> &[Condition];
    /// Mutable conditions on the status
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    /// Spec digest last sent to the broker
    fn checksum(&self) -> Option<&str>;
    /// Record the spec digest sent to the broker
    fn set_checksum(&mut self, checksum: Option<String>);
    /// Whether an asynchronous operation is running
    fn async_op_in_progress(&self) -> bool;
    /// Kind of the current or last operation
    fn current_operation(&self) -> Option<OperationKind>;
    /// Operation key of the running operation
    fn last_operation(&self) -> Option<&str>;
    /// Record a new operation, synchronous or not
    fn begin_operation(&mut self, kind: OperationKind, is_async: bool, key: Option<String>);
    /// Mark the asynchronous operation as finished
    fn finish_async_operation(&mut self);
}

macro_rules! async_operation_status {
    ($status:ty) => {
        impl AsyncOperationStatus for $status {
            fn conditions(&self) -> &[Condition] {
                &self.conditions
            }

            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.conditions
            }

            fn checksum(&self) -> Option<&str> {
                self.checksum.as_deref()
            }

            fn set_checksum(&mut self, checksum: Option<String>) {
                self.checksum = checksum;
            }

            fn async_op_in_progress(&self) -> bool {
                self.async_op_in_progress
            }

            fn current_operation(&self) -> Option<OperationKind> {
                self.current_operation
            }

            fn last_operation(&self) -> Option<&str> {
                self.last_operation.as_deref()
            }

            fn begin_operation(&mut self, kind: OperationKind, is_async: bool, key: Option<String>) {
                self.current_operation = Some(kind);
                self.async_op_in_progress = is_async;
                self.last_operation = if is_async { key } else { None };
            }

            fn finish_async_operation(&mut self) {
                self.async_op_in_progress = false;
                self.last_operation = None;
            }
        }
    };
}

async_operation_status!(ServiceInstanceStatus);
async_operation_status!(ServiceBindingStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_crds_cover_every_kind() {
        let kinds: Vec<String> = all_crds()
            .into_iter()
            .map(|crd| crd.spec.names.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                "ServiceBroker",
                "ServiceClass",
                "ServicePlan",
                "ServiceInstance",
                "ServiceBinding"
            ]
        );
    }

    #[test]
    fn scopes_match_resource_model() {
        for crd in all_crds() {
            let expected = match crd.spec.names.kind.as_str() {
                "ServiceInstance" | "ServiceBinding" => "Namespaced",
                _ => "Cluster",
            };
            assert_eq!(crd.spec.scope, expected, "{}", crd.spec.names.kind);
        }
    }

    #[test]
    fn external_ids_are_unique() {
        let a = ServiceInstanceSpec::new("db", "small");
        let b = ServiceInstanceSpec::new("db", "small");
        assert_ne!(a.external_id, b.external_id);
        assert!(!a.external_id.is_empty());
    }

    #[test]
    fn async_bookkeeping_tracks_operation_key() {
        let mut status = ServiceInstanceStatus::default();
        status.begin_operation(OperationKind::Provision, true, Some("op1".to_string()));
        assert!(status.async_op_in_progress());
        assert_eq!(status.last_operation(), Some("op1"));
        assert_eq!(status.current_operation(), Some(OperationKind::Provision));

        status.finish_async_operation();
        assert!(!status.async_op_in_progress());
        assert_eq!(status.last_operation(), None);
        assert_eq!(status.current_operation(), Some(OperationKind::Provision));
    }

    #[test]
    fn synchronous_operation_drops_stale_key() {
        let mut status = ServiceBindingStatus {
            last_operation: Some("stale".to_string()),
            ..Default::default()
        };
        status.begin_operation(OperationKind::Bind, false, Some("ignored".to_string()));
        assert!(!status.async_op_in_progress());
        assert_eq!(status.last_operation(), None);
    }

    #[test]
    fn status_or_default_creates_status() {
        let mut broker = ServiceBroker::new(
            "b",
            ServiceBrokerSpec {
                url: "https://b.example".to_string(),
                auth_info: None,
                insecure_skip_tls_verify: false,
                ca_bundle: None,
                relist_behavior: RelistBehavior::Duration,
                relist_duration_seconds: None,
                relist_requests: 0,
            },
        );
        assert!(broker.status().is_none());
        broker.status_or_default().reconciled_generation = 3;
        assert_eq!(broker.status().map(|s| s.reconciled_generation), Some(3));
    }
}
