//! kdisc schema: which kinds exist, where to list them, and which kinds they compose.
//!
//! A [`SchemaSnapshot`] is immutable. Each discovery cycle loads a fresh one from a
//! [`SchemaSource`] on top of the built-in baseline and swaps it into the shared
//! [`SchemaHandle`]; readers see either the old or the new map, never a mix.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use kdisc_core::KindSchema;

mod registry;

pub use registry::{
    parse_registry_detail, parse_registry_names, RegistrySource, DEFAULT_REGISTRY_ROOT, DEFAULT_REGISTRY_URL,
};

/// Schema load failures. `Read`/`Parse`/`Invalid` are configuration errors,
/// `Registry`/`RegistryDecode` come from the backing key-value store.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("reading schema file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("parsing schema from {origin}: {reason}")]
    Parse { origin: String, reason: String },
    #[error("invalid schema entry {kind:?}: {reason}")]
    Invalid { kind: String, reason: String },
    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),
    #[error("decoding registry key {key}: {reason}")]
    RegistryDecode { key: String, reason: String },
}

/// Built-in kinds present in every snapshot, with Deployment -> ReplicaSet -> Pod pre-wired.
pub fn baseline_kinds() -> Vec<KindSchema> {
    vec![
        KindSchema::new("Deployment", "deployments", "apis/apps/v1", &["ReplicaSet"]),
        KindSchema::new("ReplicaSet", "replicasets", "apis/apps/v1", &["Pod"]),
        KindSchema::new("Pod", "pods", "api/v1", &[]),
        KindSchema::new("Service", "services", "api/v1", &[]),
        KindSchema::new("Secret", "secrets", "api/v1", &[]),
        KindSchema::new("PersistentVolumeClaim", "persistentvolumeclaims", "api/v1", &[]),
        KindSchema::new("PersistentVolume", "persistentvolumes", "api/v1/persistentvolumes", &[]),
    ]
}

/// Immutable kind map for one cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaSnapshot {
    kinds: BTreeMap<String, KindSchema>,
}

impl SchemaSnapshot {
    pub fn baseline() -> Self {
        Self::layered(Vec::new())
    }

    /// Baseline kinds overlaid with `entries`; a loaded entry replaces the baseline entry of the same kind.
    pub fn layered(entries: Vec<KindSchema>) -> Self {
        let mut kinds = BTreeMap::new();
        for k in baseline_kinds().into_iter().chain(entries) {
            kinds.insert(k.kind.clone(), k);
        }
        Self { kinds }
    }

    pub fn get(&self, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(kind)
    }

    /// Declared child kinds of `kind`; empty for unknown kinds.
    pub fn children(&self, kind: &str) -> &[String] {
        self.kinds.get(kind).map(|k| k.composition.as_slice()).unwrap_or(&[])
    }

    /// Kinds in name order.
    pub fn kinds(&self) -> impl Iterator<Item = &KindSchema> {
        self.kinds.values()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Map a caller-supplied kind (singular or plural, any case) to the schema's kind key.
    pub fn resolve_kind(&self, name: &str) -> Option<&str> {
        self.kinds
            .values()
            .find(|k| k.kind.eq_ignore_ascii_case(name) || k.plural.eq_ignore_ascii_case(name))
            .map(|k| k.kind.as_str())
    }
}

/// Where non-baseline kinds come from.
#[async_trait::async_trait]
pub trait SchemaSource: Send + Sync {
    /// Human-readable origin for logs.
    fn describe(&self) -> String;

    async fn load(&self) -> Result<Vec<KindSchema>, SchemaError>;
}

/// Parse the declarative schema format: a YAML (or JSON) list of
/// `{kind, plural, endpoint, composition}` records.
pub fn parse_schema_yaml(text: &str, origin: &str) -> Result<Vec<KindSchema>, SchemaError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Option<Vec<KindSchema>> = serde_yaml::from_str(text).map_err(|e| SchemaError::Parse {
        origin: origin.to_string(),
        reason: e.to_string(),
    })?;
    let entries = entries.unwrap_or_default();
    for entry in &entries {
        validate(entry)?;
    }
    Ok(entries)
}

pub(crate) fn validate(entry: &KindSchema) -> Result<(), SchemaError> {
    let reason = if entry.kind.trim().is_empty() {
        "kind is empty"
    } else if entry.plural.trim().is_empty() {
        "plural is empty"
    } else if entry.endpoint.trim().is_empty() {
        "endpoint is empty"
    } else {
        return Ok(());
    };
    Err(SchemaError::Invalid { kind: entry.kind.clone(), reason: reason.to_string() })
}

/// Static schema file, re-read every cycle so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl SchemaSource for FileSource {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn load(&self) -> Result<Vec<KindSchema>, SchemaError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SchemaError::Read { path: self.path.clone(), source })?;
        parse_schema_yaml(&text, &self.path.display().to_string())
    }
}

/// Fixed entries; handy for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    entries: Vec<KindSchema>,
}

impl StaticSource {
    pub fn new(entries: Vec<KindSchema>) -> Self {
        Self { entries }
    }
}

#[async_trait::async_trait]
impl SchemaSource for StaticSource {
    fn describe(&self) -> String {
        format!("static:{} kinds", self.entries.len())
    }

    async fn load(&self) -> Result<Vec<KindSchema>, SchemaError> {
        for entry in &self.entries {
            validate(entry)?;
        }
        Ok(self.entries.clone())
    }
}

/// Shared, atomically swapped schema.
#[derive(Clone)]
pub struct SchemaHandle {
    current: Arc<ArcSwap<SchemaSnapshot>>,
}

impl Default for SchemaHandle {
    fn default() -> Self {
        Self::new(SchemaSnapshot::baseline())
    }
}

impl SchemaHandle {
    pub fn new(initial: SchemaSnapshot) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    pub fn current(&self) -> Arc<SchemaSnapshot> {
        self.current.load_full()
    }

    /// Load from `source` and swap in the result. On error the previous snapshot stays in place.
    pub async fn refresh(&self, source: &dyn SchemaSource) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        match source.load().await {
            Ok(entries) => {
                let loaded = entries.len();
                let next = Arc::new(SchemaSnapshot::layered(entries));
                self.current.store(Arc::clone(&next));
                counter!("schema_reload_total", 1u64, "outcome" => "ok");
                debug!(source = %source.describe(), loaded, kinds = next.len(), "schema reloaded");
                Ok(next)
            }
            Err(e) => {
                counter!("schema_reload_total", 1u64, "outcome" => "error");
                warn!(source = %source.describe(), error = %e, "schema reload failed; keeping previous schema");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for SchemaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaHandle").field("kinds", &self.current().len()).finish()
    }
}
