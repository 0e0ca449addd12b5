//! kdisc core types: kind schema, observed instances and composition trees.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Query name matching every record of a kind in a namespace.
pub const WILDCARD: &str = "*";

/// Derived status for objects whose replica counts report full availability.
pub const READY: &str = "Ready";

/// Relationship record for one kind: where to list it and which kinds it composes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindSchema {
    pub kind: String,
    /// Plural resource name used in API paths (e.g. `deployments`).
    pub plural: String,
    /// API group/version path (e.g. `apis/apps/v1`), or a full path for cluster-scoped kinds.
    pub endpoint: String,
    /// Ordered child kinds.
    #[serde(default)]
    pub composition: Vec<String>,
}

impl KindSchema {
    pub fn new(kind: &str, plural: &str, endpoint: &str, composition: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            plural: plural.to_string(),
            endpoint: endpoint.to_string(),
            composition: composition.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub name: String,
    pub kind: String,
    pub api_version: String,
}

/// One observed cluster object, decoded from a list response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceInstance {
    pub name: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub status: String,
    /// Owner references in declaration order.
    pub owners: SmallVec<[OwnerRef; 1]>,
}

impl ResourceInstance {
    /// First declared owner.
    pub fn owner(&self) -> Option<&OwnerRef> {
        self.owners.first()
    }

    /// Ownership is matched by owner name only; kind and namespace are not cross-checked.
    pub fn is_owned_by(&self, parent: &str, mode: OwnerMatch) -> bool {
        match mode {
            OwnerMatch::First => self.owner().map(|o| o.name == parent).unwrap_or(false),
            OwnerMatch::Any => self.owners.iter().any(|o| o.name == parent),
        }
    }
}

/// Store key of a top-level resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl Identity {
    pub fn new(kind: &str, name: &str, namespace: &str) -> Self {
        Self { kind: kind.to_string(), name: name.to_string(), namespace: namespace.to_string() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Externally visible composition tree. Field names match the published JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct CompositionNode {
    /// Depth in the tree; the root is level 1.
    pub level: usize,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub status: String,
    #[serde(default)]
    pub children: Vec<CompositionNode>,
}

impl CompositionNode {
    pub fn leaf(level: usize, kind: &str, name: &str, namespace: &str, status: &str) -> Self {
        Self {
            level,
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            status: status.to_string(),
            children: Vec::new(),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::new(&self.kind, &self.name, &self.namespace)
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Deepest level reached below (and including) this node.
    pub fn max_level(&self) -> usize {
        self.children.iter().map(|c| c.max_level()).max().unwrap_or(self.level).max(self.level)
    }
}

/// Store entry: latest status and tree of one top-level resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompositionRecord {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub tree: CompositionNode,
}

impl CompositionRecord {
    pub fn identity(&self) -> Identity {
        Identity::new(&self.kind, &self.name, &self.namespace)
    }
}

/// Which owner references link a child to its parent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OwnerMatch {
    /// Only the first owner reference counts.
    #[default]
    First,
    /// Any owner reference naming the parent counts.
    Any,
}

/// How purge decides that a stored record is still observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PurgeMatch {
    /// Full (kind, name, namespace) identity.
    #[default]
    Identity,
    /// Name only; a same-named object of another kind or namespace keeps a record alive.
    NameOnly,
}

/// Tree construction knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BuildOptions {
    /// Deepest level to expand (root = 1). `None` expands until the schema or cluster runs out.
    pub max_depth: Option<usize>,
    pub owner_match: OwnerMatch,
}

pub mod prelude {
    pub use super::{
        BuildOptions, CompositionNode, CompositionRecord, Identity, KindSchema, OwnerMatch, OwnerRef,
        PurgeMatch, ResourceInstance, READY, WILDCARD,
    };
}
