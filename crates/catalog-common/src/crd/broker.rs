//! ServiceBroker CRD
//!
//! A ServiceBroker registers an Open Service Broker endpoint. The controller
//! periodically relists its catalog into ServiceClass and ServicePlan objects.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretReference};

/// ServiceBroker registers a broker endpoint with the catalog.
///
/// Example:
/// ```yaml
/// apiVersion: servicecatalog.k8s.io/v1beta1
/// kind: ServiceBroker
/// metadata:
///   name: ups-broker
/// spec:
///   url: https://ups-broker.brokers.svc
///   authInfo:
///     basic:
///       secretRef:
///         namespace: brokers
///         name: ups-broker-auth
///   relistBehavior: Duration
///   relistDurationSeconds: 900
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBroker",
    status = "ServiceBrokerStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    /// Base URL of the broker
    pub url: String,

    /// Credentials used to talk to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<BrokerAuthInfo>,

    /// Skip TLS verification of the broker endpoint
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// PEM-encoded CA bundle for the broker endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// How the catalog is refreshed once fetched successfully
    #[serde(default)]
    pub relist_behavior: RelistBehavior,

    /// Interval between relists when `relistBehavior` is `Duration`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relist_duration_seconds: Option<u64>,

    /// Incremented by users to request a manual relist
    #[serde(default)]
    pub relist_requests: i64,
}

/// Catalog relist policy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RelistBehavior {
    /// Relist whenever the relist duration has elapsed
    #[default]
    Duration,
    /// Relist only when the spec changes
    Manual,
}

/// Broker authentication, at most one mode set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAuthInfo {
    /// Basic auth from a secret with `username` and `password` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<SecretAuth>,

    /// Bearer auth from a secret with a `token` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<SecretAuth>,
}

/// Pointer to the secret holding broker credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretAuth {
    /// The secret to read
    pub secret_ref: SecretReference,
}

/// Status of a ServiceBroker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerStatus {
    /// Ready and Failed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation whose catalog was last fetched successfully
    #[serde(default)]
    pub reconciled_generation: i64,

    /// When the current run of failing reconciliations began
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,

    /// When the catalog was last fetched successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_retrieval_time: Option<DateTime<Utc>>,
}
