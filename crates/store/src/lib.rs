//! kdisc store: latest composition tree per top-level resource, and the
//! discovery loop that keeps it fresh.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

use kdisc_core::{CompositionNode, CompositionRecord, Identity, PurgeMatch, WILDCARD};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

mod discovery;

pub use discovery::{spawn_discovery, CycleReport, Discovery, DiscoveryHandle, DiscoverySettings};

/// Table of composition records behind one lock shared by the loop and query callers.
#[derive(Debug, Default)]
pub struct CompositionStore {
    records: Mutex<FxHashMap<Identity, CompositionRecord>>,
    purge_match: PurgeMatch,
}

impl CompositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_purge_match(purge_match: PurgeMatch) -> Self {
        Self { records: Mutex::default(), purge_match }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<Identity, CompositionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the record for (kind, name, namespace).
    ///
    /// The tree root is stamped with the record's identity and status so the two never disagree.
    pub fn upsert(&self, kind: &str, name: &str, namespace: &str, status: &str, mut tree: CompositionNode) {
        tree.kind = kind.to_string();
        tree.name = name.to_string();
        tree.namespace = namespace.to_string();
        tree.status = status.to_string();
        let record = CompositionRecord {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            status: status.to_string(),
            tree,
        };
        let mut records = self.lock();
        records.insert(record.identity(), record);
        gauge!("compositions_stored", records.len() as f64);
    }

    /// Trees of records in `namespace` whose kind matches case-insensitively and whose
    /// name equals `name` (or any name for `*`). Sorted by (kind, name); empty when nothing matches.
    pub fn query(&self, kind: &str, name: &str, namespace: &str) -> Vec<CompositionNode> {
        counter!("composition_query_total", 1u64);
        let records = self.lock();
        let mut hits: Vec<&CompositionRecord> = records
            .values()
            .filter(|r| r.namespace == namespace)
            .filter(|r| r.kind.eq_ignore_ascii_case(kind))
            .filter(|r| name == WILDCARD || r.name == name)
            .collect();
        hits.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
        hits.into_iter().map(|r| r.tree.clone()).collect()
    }

    pub fn get(&self, id: &Identity) -> Option<CompositionRecord> {
        self.lock().get(id).cloned()
    }

    /// Drop every record not in `observed`; returns how many were dropped.
    ///
    /// Under [`PurgeMatch::NameOnly`] a record survives when any observed identity shares its name.
    pub fn purge(&self, observed: &FxHashSet<Identity>) -> usize {
        let names: FxHashSet<&str> = match self.purge_match {
            PurgeMatch::NameOnly => observed.iter().map(|id| id.name.as_str()).collect(),
            PurgeMatch::Identity => FxHashSet::default(),
        };
        let mut records = self.lock();
        let before = records.len();
        records.retain(|id, _| match self.purge_match {
            PurgeMatch::Identity => observed.contains(id),
            PurgeMatch::NameOnly => names.contains(id.name.as_str()),
        });
        let dropped = before - records.len();
        if dropped > 0 {
            counter!("compositions_purged_total", dropped as u64);
            debug!(dropped, remaining = records.len(), "purged stale compositions");
        }
        gauge!("compositions_stored", records.len() as f64);
        dropped
    }

    /// Identities of stored records of `kind` in `namespace`.
    pub fn identities_in(&self, kind: &str, namespace: &str) -> Vec<Identity> {
        self.lock()
            .keys()
            .filter(|id| id.kind == kind && id.namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
