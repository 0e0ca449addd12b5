//! In-memory cluster answering list reads from canned responses.
//!
//! Fixture file shape:
//!
//! ```json
//! {
//!   "namespaces": ["default", "kube-system"],
//!   "responses": {
//!     "/apis/apps/v1/namespaces/default/deployments": { "items": [ ... ] }
//!   }
//! }
//! ```
//!
//! `namespaces` may also be a `NamespaceList` body. Paths without a canned
//! response list as empty.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use kdisc_core::ResourceInstance;

use crate::{parse_instances, parse_namespaces, resource_path, ClusterApi};

#[derive(Debug, Default)]
pub struct StaticCluster {
    namespaces: Vec<String>,
    responses: FxHashMap<String, Value>,
    failing: FxHashSet<String>,
    namespaces_fail: bool,
    requests: AtomicUsize,
}

impl StaticCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.namespaces = namespaces.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Serve `body` for a raw request path.
    pub fn respond(mut self, path: &str, body: Value) -> Self {
        self.responses.insert(path.to_string(), body);
        self
    }

    /// Serve `items` as the list of `plural` in `namespace`, appending to any earlier items.
    pub fn with_items(mut self, endpoint: &str, plural: &str, namespace: &str, items: Vec<Value>) -> Self {
        let path = resource_path(endpoint, plural, namespace);
        let entry = self
            .responses
            .entry(path)
            .or_insert_with(|| serde_json::json!({ "items": [] }));
        if let Some(existing) = entry.get_mut("items").and_then(Value::as_array_mut) {
            existing.extend(items);
        }
        self
    }

    /// Make reads of `path` fail like an unreachable API server.
    pub fn fail_path(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    pub fn fail_namespaces(mut self) -> Self {
        self.namespaces_fail = true;
        self
    }

    /// Number of list calls served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn from_fixture(fixture: &Value) -> Result<Self> {
        let obj = fixture.as_object().ok_or_else(|| anyhow!("fixture must be a JSON object"))?;
        let namespaces = match obj.get("namespaces") {
            None => Vec::new(),
            Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            Some(list @ Value::Object(_)) => parse_namespaces(list),
            Some(_) => bail!("fixture `namespaces` must be an array or a NamespaceList"),
        };
        let responses = match obj.get("responses") {
            None => FxHashMap::default(),
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(_) => bail!("fixture `responses` must be an object keyed by request path"),
        };
        Ok(Self { namespaces, responses, ..Self::default() })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading fixture {}", path.display()))?;
        let value: Value = serde_json::from_str(&text).with_context(|| format!("parsing fixture {}", path.display()))?;
        Self::from_fixture(&value)
    }
}

#[async_trait::async_trait]
impl ClusterApi for StaticCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.namespaces_fail {
            bail!("namespaces unavailable");
        }
        Ok(self.namespaces.clone())
    }

    async fn list_instances(&self, endpoint: &str, plural: &str, namespace: &str) -> Result<Vec<ResourceInstance>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let path = resource_path(endpoint, plural, namespace);
        if self.failing.contains(&path) {
            bail!("GET {}: connection refused", path);
        }
        Ok(self.responses.get(&path).map(parse_instances).unwrap_or_default())
    }
}
