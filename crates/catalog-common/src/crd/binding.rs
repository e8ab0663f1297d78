//! ServiceBinding CRD

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, OperationKind};

/// Credentials for a ServiceInstance, materialized into a Secret.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBinding",
    namespaced,
    status = "ServiceBindingStatus",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instanceRef"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.secretName"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Name of the ServiceInstance in the same namespace
    pub instance_ref: String,

    /// Parameters passed to the broker; must be a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,

    /// Secret receiving the credentials, in the binding's namespace
    pub secret_name: String,

    /// Identifier sent to the broker, generated once at creation
    pub external_id: String,
}

impl ServiceBindingSpec {
    /// Create a spec with a freshly generated external ID
    pub fn new(instance_ref: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            instance_ref: instance_ref.into(),
            parameters: None,
            secret_name: secret_name.into(),
            external_id: super::new_external_id(),
        }
    }
}

/// Status of a ServiceBinding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    /// Ready and Failed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Digest of the spec last sent to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// The broker holds a binding for this resource, so deletion must unbind
    #[serde(default)]
    pub external_bound: bool,

    /// An asynchronous broker operation is still running
    #[serde(default)]
    pub async_op_in_progress: bool,

    /// Kind of the operation in progress, or of the last one issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<OperationKind>,

    /// Operation key returned by the broker for the async operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
}
