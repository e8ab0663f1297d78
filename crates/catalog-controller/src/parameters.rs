//! Request parameters and platform context sent to brokers

use catalog_osb::{Parameters, PLATFORM_KUBERNETES};
use serde_json::{Map, Value};

/// User parameters as a JSON object; absent or null means none
pub(crate) fn parameters_map(value: Option<&Value>) -> Result<Option<Parameters>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(format!(
            "parameters must be a JSON object, got {}",
            json_kind(other)
        )),
    }
}

/// Platform context identifying the requesting namespace
pub(crate) fn platform_context(namespace: &str) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert(
        "platform".to_string(),
        Value::String(PLATFORM_KUBERNETES.to_string()),
    );
    context.insert(
        "namespace".to_string(),
        Value::String(namespace.to_string()),
    );
    context
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
