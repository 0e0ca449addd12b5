//! Defensive decoding of Kubernetes-style list envelopes.
//!
//! Every field is read optionally; a malformed item is skipped and never fails
//! the whole response.

use serde_json::{Map, Value};
use tracing::debug;

use kdisc_core::{OwnerRef, ResourceInstance, READY};

/// Decode `items[]` of a list response. A body without an `items` array yields nothing.
pub fn parse_instances(body: &Value) -> Vec<ResourceInstance> {
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        debug!("list response has no items array");
        return Vec::new();
    };
    items.iter().filter_map(parse_item).collect()
}

/// Decode one list item.
///
/// Items without an object `metadata` or without `metadata.name` are dropped.
/// An item carrying a non-null `status` that is not an object is dropped too;
/// items without `status` are kept with an empty status.
pub fn parse_item(item: &Value) -> Option<ResourceInstance> {
    let obj = item.as_object()?;
    let Some(meta) = obj.get("metadata").and_then(Value::as_object) else {
        debug!("skipping item without metadata");
        return None;
    };
    let Some(name) = str_field(meta, "name") else {
        debug!("skipping item without metadata.name");
        return None;
    };

    let status = match obj.get("status") {
        None | Some(Value::Null) => String::new(),
        Some(Value::Object(status)) => derive_status(status),
        Some(_) => {
            debug!(name = %name, "skipping item with malformed status");
            return None;
        }
    };

    let owners = meta
        .get("ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(Value::as_object)
                .map(|r| OwnerRef {
                    name: str_field(r, "name").unwrap_or_default(),
                    kind: str_field(r, "kind").unwrap_or_default(),
                    api_version: str_field(r, "apiVersion").unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ResourceInstance {
        name,
        namespace: str_field(meta, "namespace").unwrap_or_default(),
        status,
        owners,
    })
}

/// Raw `phase`, overridden by `Ready` when `replicas`, `readyReplicas` and
/// `availableReplicas` are all present-and-equal and positive.
pub fn derive_status(status: &Map<String, Value>) -> String {
    let replicas = count(status, "replicas");
    if replicas > 0 && replicas == count(status, "readyReplicas") && replicas == count(status, "availableReplicas") {
        return READY.to_string();
    }
    str_field(status, "phase").unwrap_or_default()
}

/// Decode namespace names from a `NamespaceList` body.
pub fn parse_namespaces(body: &Value) -> Vec<String> {
    body.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("metadata").and_then(Value::as_object))
                .filter_map(|m| str_field(m, "name"))
                .collect()
        })
        .unwrap_or_default()
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn count(map: &Map<String, Value>, key: &str) -> i64 {
    map.get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
}
