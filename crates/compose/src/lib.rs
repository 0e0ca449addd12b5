//! kdisc compose: builds the composition tree of one top-level resource.
//!
//! A [`TreeBuilder`] lives for one discovery cycle. It reads through a listing
//! cache keyed by request path, so every distinct list call is made at most once
//! per cycle no matter how many roots or tree levels ask for it.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use futures::future::{BoxFuture, FutureExt};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use kdisc_core::{BuildOptions, CompositionNode, KindSchema, ResourceInstance};
use kdisc_kubehub::{resource_path, ClusterApi};
use kdisc_schema::SchemaSnapshot;

/// `None` marks a path whose fetch failed earlier in the cycle.
type Listing = Option<Arc<[ResourceInstance]>>;

pub struct TreeBuilder<'c> {
    cluster: &'c dyn ClusterApi,
    schema: Arc<SchemaSnapshot>,
    opts: BuildOptions,
    cache: Mutex<FxHashMap<String, Listing>>,
    fetched: AtomicUsize,
    failed: AtomicUsize,
}

impl<'c> TreeBuilder<'c> {
    pub fn new(cluster: &'c dyn ClusterApi, schema: Arc<SchemaSnapshot>, opts: BuildOptions) -> Self {
        Self {
            cluster,
            schema,
            opts,
            cache: Mutex::new(FxHashMap::default()),
            fetched: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// Distinct list calls issued so far.
    pub fn fetched_calls(&self) -> usize {
        self.fetched.load(Ordering::Relaxed)
    }

    /// List calls that failed so far.
    pub fn failed_calls(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    fn cached(&self, path: &str) -> Option<Listing> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(path).cloned()
    }

    fn remember(&self, path: String, listing: Listing) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).insert(path, listing);
    }

    /// Instances of `kind` visible from `namespace`. Errors are returned to the caller.
    ///
    /// A path that failed once in this cycle keeps failing without another request.
    pub async fn try_list(&self, kind: &KindSchema, namespace: &str) -> Result<Arc<[ResourceInstance]>> {
        let path = resource_path(&kind.endpoint, &kind.plural, namespace);
        if let Some(hit) = self.cached(&path) {
            debug!(path = %path, "listing cache hit");
            return hit.ok_or_else(|| anyhow!("GET {} already failed this cycle", path));
        }
        self.fetched.fetch_add(1, Ordering::Relaxed);
        match self.cluster.list_instances(&kind.endpoint, &kind.plural, namespace).await {
            Ok(items) => {
                counter!("cluster_requests_total", 1u64, "outcome" => "ok");
                let items: Arc<[ResourceInstance]> = items.into();
                self.remember(path, Some(Arc::clone(&items)));
                Ok(items)
            }
            Err(e) => {
                counter!("cluster_requests_total", 1u64, "outcome" => "error");
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.remember(path, None);
                Err(e)
            }
        }
    }

    /// Like [`try_list`](Self::try_list) but a failure is logged and reads as "no instances".
    pub async fn list(&self, kind: &KindSchema, namespace: &str) -> Arc<[ResourceInstance]> {
        match self.try_list(kind, namespace).await {
            Ok(items) => items,
            Err(e) => {
                warn!(kind = %kind.kind, ns = %namespace, error = %e, "list failed; treating as empty");
                Arc::from(Vec::new())
            }
        }
    }

    /// Composition tree rooted at (kind, name, namespace), level 1.
    ///
    /// Children are listed in `namespace`. A cluster-scoped root has no namespace of
    /// its own, so the caller picks one; the discovery loop builds it once per cycle,
    /// in the first namespace of the listing that returned it. The root's status is
    /// left empty; callers holding the observed instance fill it in.
    pub async fn build(&self, kind: &str, name: &str, namespace: &str) -> CompositionNode {
        let mut root = CompositionNode::leaf(1, kind, name, namespace, "");
        let mut path = vec![(kind.to_string(), name.to_string())];
        root.children = self.expand(kind, name, namespace, 1, &mut path).await;
        debug!(kind = %kind, name = %name, ns = %namespace, nodes = root.node_count(), "tree built");
        root
    }

    /// Children of the node (kind, name) at `level`.
    ///
    /// `path` holds the (kind, name) pairs of every open ancestor; an instance
    /// already on it is not attached again.
    fn expand<'a>(
        &'a self,
        kind: &'a str,
        name: &'a str,
        namespace: &'a str,
        level: usize,
        path: &'a mut Vec<(String, String)>,
    ) -> BoxFuture<'a, Vec<CompositionNode>> {
        async move {
            let mut out = Vec::new();
            if self.opts.max_depth.is_some_and(|max| level >= max) {
                return out;
            }
            for child_kind in self.schema.children(kind) {
                let Some(child_schema) = self.schema.get(child_kind) else {
                    debug!(parent = %kind, child = %child_kind, "child kind not in schema");
                    continue;
                };
                let instances = self.list(child_schema, namespace).await;
                let mut seen: FxHashSet<&str> = FxHashSet::default();
                for inst in instances.iter().filter(|i| i.is_owned_by(name, self.opts.owner_match)) {
                    if !seen.insert(inst.name.as_str()) {
                        continue;
                    }
                    if path.iter().any(|(k, n)| k == child_kind && n == &inst.name) {
                        debug!(kind = %child_kind, name = %inst.name, "ownership cycle; not revisiting");
                        continue;
                    }
                    let mut node =
                        CompositionNode::leaf(level + 1, child_kind, &inst.name, &inst.namespace, &inst.status);
                    let scan_ns = if inst.namespace.is_empty() { namespace } else { inst.namespace.as_str() };
                    path.push((child_kind.clone(), inst.name.clone()));
                    node.children = self.expand(child_kind, &inst.name, scan_ns, level + 1, path).await;
                    path.pop();
                    out.push(node);
                }
            }
            out
        }
        .boxed()
    }
}
