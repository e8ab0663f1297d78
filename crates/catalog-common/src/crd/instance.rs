//! ServiceInstance CRD
//!
//! A ServiceInstance asks a broker to provision a plan of a class. The
//! controller owns its status and a single finalizer token.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, OperationKind};

/// A provisioned (or to-be-provisioned) service.
///
/// Example:
/// ```yaml
/// apiVersion: servicecatalog.k8s.io/v1beta1
/// kind: ServiceInstance
/// metadata:
///   name: orders-db
///   namespace: shop
/// spec:
///   serviceClassExternalName: postgres
///   servicePlanExternalName: small
///   externalId: 7c1d5a8e-6b7e-4b59-a3b0-3f0a2a5d1b11
///   parameters:
///     storageGb: 20
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceInstance",
    namespaced,
    status = "ServiceInstanceStatus",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.serviceClassExternalName"}"#,
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".spec.servicePlanExternalName"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// External name of the ServiceClass to provision
    pub service_class_external_name: String,

    /// External name of the ServicePlan to provision
    pub service_plan_external_name: String,

    /// Parameters passed to the broker; must be a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,

    /// Identifier sent to the broker, generated once at creation
    pub external_id: String,
}

impl ServiceInstanceSpec {
    /// Create a spec with a freshly generated external ID
    pub fn new(class_external_name: impl Into<String>, plan_external_name: impl Into<String>) -> Self {
        Self {
            service_class_external_name: class_external_name.into(),
            service_plan_external_name: plan_external_name.into(),
            parameters: None,
            external_id: super::new_external_id(),
        }
    }
}

/// Status of a ServiceInstance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    /// Ready and Failed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Digest of the spec last sent to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// An asynchronous broker operation is still running
    #[serde(default)]
    pub async_op_in_progress: bool,

    /// Kind of the operation in progress, or of the last one issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<OperationKind>,

    /// Operation key returned by the broker for the async operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,

    /// Dashboard URL returned by the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,

    /// The broker confirmed provisioning; later spec changes are sent as updates
    #[serde(default)]
    pub provisioned: bool,
}
