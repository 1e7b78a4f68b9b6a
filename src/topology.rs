//! Topology Analyzer (C3): builds a dependency map, critical paths and
//! bottleneck tiers from the current cluster snapshot, and derives a
//! resilience score. Runs on a periodic loop; a failed fetch never
//! overwrites the last good snapshot (Invariant 5).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus};
use crate::cluster_client::ClusterClient;
use crate::config::TopologyConfig;
use crate::model::{Bottleneck, BottleneckTier, HistoryRing, Resource, ResourceRef, TopologySnapshot};

/// Pure computation: given a resource list, normalize resource quantity
/// strings, then build the dependency map, critical paths, bottleneck tiers
/// and resilience score. No I/O, no clock dependency beyond the
/// caller-supplied timestamp.
pub fn analyze(
    resources: Vec<Resource>,
    taken_at: chrono::DateTime<chrono::Utc>,
    depth_limit: usize,
    bottleneck_threshold: usize,
) -> TopologySnapshot {
    let resources = normalize(resources);
    let dependency_map = build_dependency_map(&resources);
    let critical_paths = critical_paths(&dependency_map, depth_limit);
    let bottlenecks = bottlenecks(&dependency_map, bottleneck_threshold);
    let resilience_score = resilience_score(&resources, &bottlenecks);

    TopologySnapshot {
        taken_at,
        resources,
        dependency_map,
        critical_paths,
        bottlenecks,
        resilience_score,
    }
}

/// Parses a Kubernetes-style CPU quantity ("100m" or a bare core count like
/// "0.5"/"2") into millicores.
pub fn parse_cpu_millis(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        millis.parse::<u64>().ok()
    } else {
        raw.parse::<f64>().ok().map(|cores| (cores * 1000.0).round() as u64)
    }
}

/// Parses a Kubernetes-style memory quantity ("512Mi", "1Gi", "256Ki", or a
/// bare byte count) into GiB.
pub fn parse_memory_gib(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let (digits, bytes_per_unit) = if let Some(d) = raw.strip_suffix("Ki") {
        (d, 1024.0)
    } else if let Some(d) = raw.strip_suffix("Mi") {
        (d, 1024.0 * 1024.0)
    } else if let Some(d) = raw.strip_suffix("Gi") {
        (d, 1024.0 * 1024.0 * 1024.0)
    } else {
        (raw, 1.0)
    };
    digits.parse::<f64>().ok().map(|v| v * bytes_per_unit / (1024.0 * 1024.0 * 1024.0))
}

/// Fills the normalized numeric fields from their raw quantity-string
/// counterparts wherever a fetch supplied a raw string but no already-parsed
/// value (spec.md §4.2 step 2: fetch raw, then normalize).
fn normalize(mut resources: Vec<Resource>) -> Vec<Resource> {
    for r in &mut resources {
        if r.cpu_request_millis.is_none() {
            r.cpu_request_millis = r.cpu_request_raw.as_deref().and_then(parse_cpu_millis);
        }
        if r.cpu_limit_millis.is_none() {
            r.cpu_limit_millis = r.cpu_limit_raw.as_deref().and_then(parse_cpu_millis);
        }
        if r.memory_request_gib.is_none() {
            r.memory_request_gib = r.memory_request_raw.as_deref().and_then(parse_memory_gib);
        }
        if r.memory_limit_gib.is_none() {
            r.memory_limit_gib = r.memory_limit_raw.as_deref().and_then(parse_memory_gib);
        }
    }
    resources
}

/// Edges: a resource depends on another resource if it references its name
/// in `env_refs` (DNS-style references), or if the other resource's
/// selector matches its labels (service -> pod selection).
fn build_dependency_map(resources: &[Resource]) -> BTreeMap<ResourceRef, BTreeSet<ResourceRef>> {
    let by_name: HashMap<&str, Vec<&Resource>> = {
        let mut map: HashMap<&str, Vec<&Resource>> = HashMap::new();
        for r in resources {
            map.entry(r.reference.name.as_str()).or_default().push(r);
        }
        map
    };

    let mut map = BTreeMap::new();
    for r in resources {
        let mut deps: BTreeSet<ResourceRef> = BTreeSet::new();
        for env_ref in &r.env_refs {
            if let Some(targets) = by_name.get(env_ref.as_str()) {
                for t in targets {
                    if t.reference != r.reference {
                        deps.insert(t.reference.clone());
                    }
                }
            }
        }
        for other in resources {
            if other.reference == r.reference || other.selector.is_empty() {
                continue;
            }
            let matches = other
                .selector
                .iter()
                .all(|(k, v)| r.labels.get(k) == Some(v));
            if matches {
                deps.insert(other.reference.clone());
            }
        }
        map.insert(r.reference.clone(), deps);
    }
    map
}

/// Depth-capped DFS over the dependency map, collecting every path from a
/// root (no one depends on it) down to a leaf, sorted longest-first.
fn critical_paths(
    dependency_map: &BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
    depth_limit: usize,
) -> Vec<Vec<ResourceRef>> {
    let mut depended_on: BTreeSet<ResourceRef> = BTreeSet::new();
    for deps in dependency_map.values() {
        depended_on.extend(deps.iter().cloned());
    }
    let roots: Vec<ResourceRef> = dependency_map
        .keys()
        .filter(|k| !depended_on.contains(*k))
        .cloned()
        .collect();

    let mut paths = Vec::new();
    for root in roots {
        let mut stack = vec![root.clone()];
        dfs(dependency_map, &root, depth_limit, &mut stack, &mut paths);
    }
    paths.sort_by(|a, b| b.len().cmp(&a.len()));
    paths
}

fn dfs(
    dependency_map: &BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
    node: &ResourceRef,
    remaining_depth: usize,
    stack: &mut Vec<ResourceRef>,
    out: &mut Vec<Vec<ResourceRef>>,
) {
    let children = dependency_map.get(node);
    let has_children = children.map(|c| !c.is_empty()).unwrap_or(false);
    if remaining_depth == 0 || !has_children {
        out.push(stack.clone());
        return;
    }
    for child in children.unwrap() {
        if stack.contains(child) {
            // cycle guard: record the path up to here rather than looping.
            out.push(stack.clone());
            continue;
        }
        stack.push(child.clone());
        dfs(dependency_map, child, remaining_depth - 1, stack, out);
        stack.pop();
    }
}

fn bottlenecks(
    dependency_map: &BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
    threshold: usize,
) -> Vec<Bottleneck> {
    let mut incoming: HashMap<ResourceRef, usize> = HashMap::new();
    for deps in dependency_map.values() {
        for d in deps {
            *incoming.entry(d.clone()).or_insert(0) += 1;
        }
    }
    let mut out: Vec<Bottleneck> = incoming
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(resource, incoming_edges)| Bottleneck {
            tier: if incoming_edges >= 10 {
                BottleneckTier::Critical
            } else {
                BottleneckTier::High
            },
            resource,
            incoming_edges,
        })
        .collect();
    out.sort_by(|a, b| b.incoming_edges.cmp(&a.incoming_edges).then(a.resource.cmp(&b.resource)));
    out
}

/// Strips a trailing Kubernetes-style generated suffix (the replicaset hash
/// and/or pod hash segments that `<deployment>-<replicaset-hash>-<pod-hash>`
/// naming appends) so replicated pods from the same workload collapse onto
/// one base name. Strips at most two trailing `-<hash>` segments, where a
/// segment counts as a hash if it is lowercase alphanumeric, 5-10 characters
/// long, and contains at least one digit (distinguishing it from a plain
/// word segment of the base name).
fn strip_pod_suffix(name: &str) -> &str {
    let mut rest = name;
    for _ in 0..2 {
        match rest.rfind('-') {
            Some(idx) => {
                let segment = &rest[idx + 1..];
                if is_hash_like(segment) {
                    rest = &rest[..idx];
                } else {
                    break;
                }
            }
            None => break,
        }
    }
    rest
}

fn is_hash_like(segment: &str) -> bool {
    (5..=10).contains(&segment.len())
        && segment.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && segment.chars().any(|c| c.is_ascii_digit())
}

/// Resilience score per spec.md §4.2 step 6: penalize single points of
/// failure and bottlenecks, reward redundancy. Redundancy is the fraction of
/// pods whose base name (suffix hash stripped) recurs among the pod set —
/// not a raw count, so its contribution is bounded to [0, 10].
fn resilience_score(resources: &[Resource], bottlenecks: &[Bottleneck]) -> f64 {
    let spof_count = bottlenecks.iter().filter(|b| b.tier == BottleneckTier::Critical).count();

    let pods: Vec<&Resource> = resources.iter().filter(|r| r.reference.kind == "Pod").collect();
    let redundancy = if pods.is_empty() {
        0.0
    } else {
        let mut base_name_counts: HashMap<&str, usize> = HashMap::new();
        for pod in &pods {
            *base_name_counts.entry(strip_pod_suffix(&pod.reference.name)).or_insert(0) += 1;
        }
        let replicated_pods: usize = pods
            .iter()
            .filter(|pod| base_name_counts[strip_pod_suffix(&pod.reference.name)] > 1)
            .count();
        replicated_pods as f64 / pods.len() as f64
    };

    let score = 100.0
        - 10.0 * spof_count as f64
        - (bottlenecks.len() as f64 * 5.0).min(30.0)
        + 10.0 * redundancy;
    score.clamp(0.0, 100.0)
}

/// Owns the periodic analysis loop and the last-good snapshot. A failed
/// fetch leaves `snapshot()` unchanged and publishes `analysisFailed`
/// instead.
pub struct TopologyAnalyzer {
    config: TopologyConfig,
    bus: Arc<EventBus>,
    client: Arc<dyn ClusterClient>,
    snapshot: Mutex<Arc<TopologySnapshot>>,
    history: Mutex<HistoryRing<Arc<TopologySnapshot>>>,
    running: AtomicBool,
}

impl TopologyAnalyzer {
    pub fn new(config: TopologyConfig, bus: Arc<EventBus>, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            snapshot: Mutex::new(Arc::new(TopologySnapshot::empty(chrono::Utc::now()))),
            history: Mutex::new(HistoryRing::new(1000)),
            config,
            bus,
            client,
            running: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.lock().expect("topology lock poisoned").clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fetches topology with a timeout and bounded retries, publishing
    /// `analysisComplete` on success or `analysisFailed` on exhaustion. The
    /// last good snapshot is retained on failure.
    pub async fn run_once(&self) {
        let deadline = std::time::Duration::from_secs(self.config.per_call_deadline_secs);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let fetch = tokio::time::timeout(deadline, self.client.get_current_topology()).await;
            match fetch {
                Ok(Ok(resources)) => {
                    let snapshot = Arc::new(analyze(
                        resources,
                        chrono::Utc::now(),
                        self.config.depth_limit,
                        self.config.bottleneck_threshold,
                    ));
                    *self.snapshot.lock().expect("topology lock poisoned") = snapshot.clone();
                    self.history.lock().expect("history lock poisoned").push(snapshot.clone());
                    self.bus.publish(Event::new(
                        "analysisComplete",
                        json!({
                            "resilienceScore": snapshot.resilience_score,
                            "bottleneckCount": snapshot.bottlenecks.len(),
                            "resourceCount": snapshot.resources.len(),
                        }),
                    ));
                    return;
                }
                Ok(Err(err)) if err.is_transient() && attempt <= self.config.max_retries => {
                    tracing::warn!(attempt, %err, "topology_fetch_retrying");
                    continue;
                }
                Ok(Err(err)) => {
                    tracing::error!(%err, "topology_fetch_failed");
                    self.bus.publish(Event::new("analysisFailed", json!({ "error": err.to_string() })));
                    return;
                }
                Err(_) => {
                    if attempt <= self.config.max_retries {
                        tracing::warn!(attempt, "topology_fetch_timed_out_retrying");
                        continue;
                    }
                    tracing::error!("topology_fetch_timed_out");
                    self.bus.publish(Event::new("analysisFailed", json!({ "error": "timeout" })));
                    return;
                }
            }
        }
    }

    pub async fn spawn_loop(self: Arc<Self>, cancel: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.config.analysis_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => self.run_once().await,
                _ = cancel.cancelled() => break,
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}
