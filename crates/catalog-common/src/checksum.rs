//! Checksum guard
//!
//! A SHA-256 digest over the spec fields that define provisioned state.
//! JSON objects are hashed with sorted keys so semantically equal parameters
//! produce equal digests regardless of key order.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::crd::{ServiceBindingSpec, ServiceInstanceSpec};

/// Digest of the provisioning-relevant fields of an instance spec
pub fn instance_checksum(spec: &ServiceInstanceSpec) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, "serviceClassExternalName", &spec.service_class_external_name);
    write_field(&mut hasher, "servicePlanExternalName", &spec.service_plan_external_name);
    write_field(&mut hasher, "externalId", &spec.external_id);
    write_parameters(&mut hasher, spec.parameters.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Digest of the binding-relevant fields of a binding spec
pub fn binding_checksum(spec: &ServiceBindingSpec) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, "instanceRef", &spec.instance_ref);
    write_field(&mut hasher, "secretName", &spec.secret_name);
    write_field(&mut hasher, "externalId", &spec.external_id);
    write_parameters(&mut hasher, spec.parameters.as_ref());
    format!("{:x}", hasher.finalize())
}

/// True when the resource needs no work: spec unchanged, nothing in flight,
/// no deletion pending
pub fn is_unchanged(
    current: &str,
    recorded: Option<&str>,
    async_op_in_progress: bool,
    deleting: bool,
) -> bool {
    recorded == Some(current) && !async_op_in_progress && !deleting
}

fn write_field(hasher: &mut Sha256, name: &str, value: &str) {
    write_str(hasher, name);
    write_str(hasher, value);
}

fn write_parameters(hasher: &mut Sha256, parameters: Option<&Value>) {
    write_str(hasher, "parameters");
    match parameters {
        Some(value) => write_value(hasher, value),
        None => hasher.update([0u8]),
    }
}

/// Length-prefixed so adjacent fields cannot collide
fn write_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([1u8]),
        Value::Bool(b) => hasher.update([2u8, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([3u8]);
            write_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update([4u8]);
            write_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update([5u8]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([6u8]);
            hasher.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                write_str(hasher, key);
                write_value(hasher, &map[key.as_str()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(parameters: Option<Value>) -> ServiceInstanceSpec {
        ServiceInstanceSpec {
            service_class_external_name: "postgres".to_string(),
            service_plan_external_name: "small".to_string(),
            parameters,
            external_id: "ext-1".to_string(),
        }
    }

    #[test]
    fn equal_specs_have_equal_digests() {
        let a = instance(Some(json!({"size": 10})));
        let b = instance(Some(json!({"size": 10})));
        assert_eq!(instance_checksum(&a), instance_checksum(&b));
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"x":true,"y":[1,2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"y":[1,2],"x":true},"a":1}"#).unwrap();
        assert_eq!(
            instance_checksum(&instance(Some(a))),
            instance_checksum(&instance(Some(b)))
        );
    }

    #[test]
    fn array_order_matters() {
        let a = instance(Some(json!({"zones": ["a", "b"]})));
        let b = instance(Some(json!({"zones": ["b", "a"]})));
        assert_ne!(instance_checksum(&a), instance_checksum(&b));
    }

    #[test]
    fn each_relevant_field_changes_the_digest() {
        let base = instance(None);
        let base_sum = instance_checksum(&base);

        let mut plan = base.clone();
        plan.service_plan_external_name = "large".to_string();
        assert_ne!(instance_checksum(&plan), base_sum);

        let mut id = base.clone();
        id.external_id = "ext-2".to_string();
        assert_ne!(instance_checksum(&id), base_sum);

        let with_params = instance(Some(json!({})));
        assert_ne!(instance_checksum(&with_params), base_sum);
    }

    #[test]
    fn adjacent_fields_do_not_collide() {
        let mut a = instance(None);
        a.service_class_external_name = "ab".to_string();
        a.service_plan_external_name = "c".to_string();
        let mut b = instance(None);
        b.service_class_external_name = "a".to_string();
        b.service_plan_external_name = "bc".to_string();
        assert_ne!(instance_checksum(&a), instance_checksum(&b));
    }

    #[test]
    fn binding_digest_tracks_secret_name() {
        let a = ServiceBindingSpec {
            instance_ref: "db".to_string(),
            parameters: None,
            secret_name: "db-creds".to_string(),
            external_id: "b-1".to_string(),
        };
        let mut b = a.clone();
        b.secret_name = "other".to_string();
        assert_ne!(binding_checksum(&a), binding_checksum(&b));
        assert_eq!(binding_checksum(&a).len(), 64);
    }

    #[test]
    fn unchanged_requires_match_and_idle() {
        assert!(is_unchanged("abc", Some("abc"), false, false));
        assert!(!is_unchanged("abc", None, false, false));
        assert!(!is_unchanged("abc", Some("abd"), false, false));
        assert!(!is_unchanged("abc", Some("abc"), true, false));
        assert!(!is_unchanged("abc", Some("abc"), false, true));
    }
}
