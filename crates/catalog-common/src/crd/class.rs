//! ServiceClass CRD, one per service in a broker catalog

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A service offered by a broker.
///
/// Named by the broker-assigned external ID; `externalName` is the
/// human-facing name users reference from a ServiceInstance.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceClass",
    status = "ServiceClassStatus",
    printcolumn = r#"{"name":"External Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.brokerName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    /// Name of the owning ServiceBroker
    pub broker_name: String,

    /// Broker-assigned identifier
    pub external_id: String,

    /// Broker-assigned display name
    pub external_name: String,

    /// Description from the catalog
    #[serde(default)]
    pub description: String,

    /// Whether instances of this class can be bound by default
    #[serde(default)]
    pub bindable: bool,

    /// Whether instances may change plans
    #[serde(default)]
    pub plan_updatable: bool,

    /// Catalog tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Platform permissions the service requires
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Opaque catalog metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub external_metadata: Option<serde_json::Value>,
}

/// Status of a ServiceClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassStatus {
    /// Set when the broker no longer lists this class
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}
