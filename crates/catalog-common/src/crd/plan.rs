//! ServicePlan CRD, one per plan in a broker catalog

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A plan of a ServiceClass.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServicePlan",
    status = "ServicePlanStatus",
    printcolumn = r#"{"name":"External Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.serviceClassRef"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.brokerName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanSpec {
    /// Name of the owning ServiceBroker
    pub broker_name: String,

    /// Name of the ServiceClass this plan belongs to
    pub service_class_ref: String,

    /// Broker-assigned identifier
    pub external_id: String,

    /// Broker-assigned display name
    pub external_name: String,

    /// Description from the catalog
    #[serde(default)]
    pub description: String,

    /// Whether the plan is free of charge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,

    /// Overrides the class `bindable` flag when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,

    /// Opaque catalog metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub external_metadata: Option<serde_json::Value>,

    /// Schema for instance create parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub instance_create_parameter_schema: Option<serde_json::Value>,

    /// Schema for instance update parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub instance_update_parameter_schema: Option<serde_json::Value>,

    /// Schema for binding create parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub binding_create_parameter_schema: Option<serde_json::Value>,
}

/// Status of a ServicePlan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanStatus {
    /// Set when the broker no longer lists this plan
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}
