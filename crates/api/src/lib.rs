//! kdisc public query façade (in-process).
//!
//! Frontends (the CLI, or an HTTP layer) depend on [`DiscoveryApi`] only.
//! [`InProcApi`] answers from the shared store and schema handle; [`MockApi`]
//! serves canned data.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use kdisc_core::{CompositionNode, KindSchema};
use kdisc_schema::SchemaHandle;
use kdisc_store::CompositionStore;

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[async_trait::async_trait]
pub trait DiscoveryApi: Send + Sync {
    /// Composition trees of (kind, name, namespace). `kind` may be singular or plural in
    /// any case; `name` may be `*`. No match is an empty list.
    async fn get_compositions(&self, kind: &str, name: &str, namespace: &str) -> ApiResult<Vec<CompositionNode>>;

    /// [`get_compositions`](Self::get_compositions) rendered as a JSON array.
    async fn get_compositions_json(&self, kind: &str, name: &str, namespace: &str) -> ApiResult<String> {
        let trees = self.get_compositions(kind, name, namespace).await?;
        serde_json::to_string(&trees).map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Current schema, in kind order.
    async fn kinds(&self) -> ApiResult<Vec<KindSchema>>;

    /// Schema entry for a singular or plural kind name.
    async fn describe_kind(&self, kind: &str) -> ApiResult<KindSchema>;
}

fn validate(kind: &str, name: &str) -> ApiResult<()> {
    if kind.trim().is_empty() {
        return Err(ApiError::Validation("kind must not be empty".into()));
    }
    if name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty (use * for all)".into()));
    }
    Ok(())
}

// ----------------- In-process implementation -----------------

#[derive(Clone)]
pub struct InProcApi {
    store: Arc<CompositionStore>,
    schema: SchemaHandle,
}

impl InProcApi {
    pub fn new(store: Arc<CompositionStore>, schema: SchemaHandle) -> Self {
        Self { store, schema }
    }
}

#[async_trait::async_trait]
impl DiscoveryApi for InProcApi {
    async fn get_compositions(&self, kind: &str, name: &str, namespace: &str) -> ApiResult<Vec<CompositionNode>> {
        validate(kind, name)?;
        let t0 = Instant::now();
        let snapshot = self.schema.current();
        let resolved = snapshot.resolve_kind(kind).unwrap_or(kind);
        let trees = self.store.query(resolved, name, namespace);
        debug!(kind = %resolved, name = %name, ns = %namespace, hits = trees.len(), took_ms = %t0.elapsed().as_millis(), "api: compositions");
        Ok(trees)
    }

    async fn kinds(&self) -> ApiResult<Vec<KindSchema>> {
        Ok(self.schema.current().kinds().cloned().collect())
    }

    async fn describe_kind(&self, kind: &str) -> ApiResult<KindSchema> {
        let snapshot = self.schema.current();
        snapshot
            .resolve_kind(kind)
            .and_then(|k| snapshot.get(k))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("kind {}", kind)))
    }
}

// ----------------- Mock implementation -----------------

#[derive(Debug, Clone, Default)]
pub struct MockApi {
    pub trees: Vec<CompositionNode>,
    pub kinds: Vec<KindSchema>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DiscoveryApi for MockApi {
    async fn get_compositions(&self, kind: &str, name: &str, namespace: &str) -> ApiResult<Vec<CompositionNode>> {
        validate(kind, name)?;
        Ok(self
            .trees
            .iter()
            .filter(|t| t.kind.eq_ignore_ascii_case(kind) && t.namespace == namespace)
            .filter(|t| name == kdisc_core::WILDCARD || t.name == name)
            .cloned()
            .collect())
    }

    async fn kinds(&self) -> ApiResult<Vec<KindSchema>> {
        Ok(self.kinds.clone())
    }

    async fn describe_kind(&self, kind: &str) -> ApiResult<KindSchema> {
        self.kinds
            .iter()
            .find(|k| k.kind.eq_ignore_ascii_case(kind) || k.plural.eq_ignore_ascii_case(kind))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("kind {}", kind)))
    }
}
