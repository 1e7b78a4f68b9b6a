//! Shared value types used across every component: resource identity, the
//! topology snapshot produced by the analyzer, and the bounded history ring
//! reused by the analyzer, compliance checker, budget enforcer and health
//! monitor.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a cluster resource by kind, namespace and name. Structural
/// equality and a total order so it can key both hash maps and sorted
/// output deterministically in tests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A single resource as seen by the cluster client. Intentionally flatter
/// than a real Kubernetes object: just the fields every compliance policy
/// and the topology analyzer actually need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub reference: ResourceRef,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub env_refs: Vec<String>,
    /// Raw quantity strings as a cluster client would return them (e.g.
    /// `"100m"`, `"2"` for cpu; `"512Mi"`, `"1Gi"` for memory), normalized
    /// into the fields below by `topology::analyze`'s normalize step.
    pub cpu_request_raw: Option<String>,
    pub cpu_limit_raw: Option<String>,
    pub memory_request_raw: Option<String>,
    pub memory_limit_raw: Option<String>,
    pub cpu_request_millis: Option<u64>,
    pub cpu_limit_millis: Option<u64>,
    pub memory_request_gib: Option<f64>,
    pub memory_limit_gib: Option<f64>,
    pub image: Option<String>,
    pub replicas: Option<u32>,
    pub has_liveness_probe: bool,
    pub has_readiness_probe: bool,
    pub run_as_non_root: Option<bool>,
    pub read_only_root_filesystem: Option<bool>,
    pub privileged: Option<bool>,
    pub network_policy_attached: bool,
    pub restart_count: u32,
}

impl Resource {
    pub fn new(reference: ResourceRef) -> Self {
        Self {
            reference,
            labels: BTreeMap::new(),
            selector: BTreeMap::new(),
            env_refs: Vec::new(),
            cpu_request_raw: None,
            cpu_limit_raw: None,
            memory_request_raw: None,
            memory_limit_raw: None,
            cpu_request_millis: None,
            cpu_limit_millis: None,
            memory_request_gib: None,
            memory_limit_gib: None,
            image: None,
            replicas: None,
            has_liveness_probe: false,
            has_readiness_probe: false,
            run_as_non_root: None,
            read_only_root_filesystem: None,
            privileged: None,
            network_policy_attached: false,
            restart_count: 0,
        }
    }
}

/// An immutable view of the cluster at one point in time, produced once per
/// analysis tick and shared via `Arc` so a failed re-analysis can keep
/// serving the last good snapshot without copying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub taken_at: DateTime<Utc>,
    pub resources: Vec<Resource>,
    pub dependency_map: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
    pub critical_paths: Vec<Vec<ResourceRef>>,
    pub bottlenecks: Vec<Bottleneck>,
    pub resilience_score: f64,
}

impl TopologySnapshot {
    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            resources: Vec::new(),
            dependency_map: BTreeMap::new(),
            critical_paths: Vec::new(),
            bottlenecks: Vec::new(),
            resilience_score: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub resource: ResourceRef,
    pub incoming_edges: usize,
    pub tier: BottleneckTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BottleneckTier {
    High,
    Critical,
}

/// A bounded FIFO ring. Oldest entries are dropped once `capacity` is
/// exceeded; used for every per-component history list in the data model
/// (topology results, compliance summaries, cost updates, health checks).
#[derive(Debug, Clone)]
pub struct HistoryRing<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> HistoryRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<&T> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
