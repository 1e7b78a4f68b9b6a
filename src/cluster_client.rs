//! The abstract seam between this crate's components and whatever actually
//! talks to Kubernetes. Every other component depends only on
//! `ClusterClient`, never on `kube`/`k8s_openapi` directly, so the control
//! plane stays testable without a cluster.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::ClusterError;
use crate::model::{Resource, ResourceRef, TopologySnapshot};

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches every resource currently known to the cluster. The topology
    /// analyzer builds its snapshot from the returned list; this call never
    /// returns a partial list on error, only `Err`.
    async fn get_current_topology(&self) -> Result<Vec<Resource>, ClusterError>;

    /// Scales `target` to `replicas`. Used by the orchestration engine's
    /// `scale` action.
    async fn scale(&self, target: &ResourceRef, replicas: u32) -> Result<(), ClusterError>;

    /// Restarts `target` (e.g. a rolling restart). Used by the
    /// orchestration engine's `restart` action.
    async fn restart(&self, target: &ResourceRef) -> Result<(), ClusterError>;

    /// Marks `target` as draining so the load balancer stops routing to it.
    async fn drain(&self, target: &ResourceRef) -> Result<(), ClusterError>;

    /// Evicts `target` outright. Used by the orchestration engine's
    /// quarantine action (drain, then evict) for critical image-policy
    /// violations.
    async fn evict(&self, target: &ResourceRef) -> Result<(), ClusterError>;

    /// Cordons `node` so the external scheduler stops placing new pods on
    /// it. Not currently driven by any orchestration trigger in this crate,
    /// but part of the cluster client surface per the external interfaces
    /// section.
    async fn cordon_node(&self, node: &str) -> Result<(), ClusterError>;
}

/// An in-memory `ClusterClient` used by tests and by `serve --dry-run`. State
/// is mutated through the same trait methods a real adapter would expose,
/// so tests exercise the exact interface the rest of the crate calls.
#[derive(Default)]
pub struct StaticClusterClient {
    resources: Mutex<Vec<Resource>>,
    replicas: Mutex<HashMap<ResourceRef, u32>>,
    restart_calls: Mutex<Vec<ResourceRef>>,
    drained: Mutex<Vec<ResourceRef>>,
    evicted: Mutex<Vec<ResourceRef>>,
    cordoned_nodes: Mutex<Vec<String>>,
    fail_topology: Mutex<bool>,
}

impl StaticClusterClient {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self {
            resources: Mutex::new(resources),
            replicas: Mutex::new(HashMap::new()),
            restart_calls: Mutex::new(Vec::new()),
            drained: Mutex::new(Vec::new()),
            evicted: Mutex::new(Vec::new()),
            cordoned_nodes: Mutex::new(Vec::new()),
            fail_topology: Mutex::new(false),
        }
    }

    pub fn set_fail_topology(&self, fail: bool) {
        *self.fail_topology.lock().expect("lock poisoned") = fail;
    }

    pub fn restart_calls(&self) -> Vec<ResourceRef> {
        self.restart_calls.lock().expect("lock poisoned").clone()
    }

    pub fn drained(&self) -> Vec<ResourceRef> {
        self.drained.lock().expect("lock poisoned").clone()
    }

    pub fn evicted(&self) -> Vec<ResourceRef> {
        self.evicted.lock().expect("lock poisoned").clone()
    }

    pub fn cordoned_nodes(&self) -> Vec<String> {
        self.cordoned_nodes.lock().expect("lock poisoned").clone()
    }

    pub fn replicas_of(&self, target: &ResourceRef) -> Option<u32> {
        self.replicas.lock().expect("lock poisoned").get(target).copied()
    }
}

#[async_trait]
impl ClusterClient for StaticClusterClient {
    async fn get_current_topology(&self) -> Result<Vec<Resource>, ClusterError> {
        if *self.fail_topology.lock().expect("lock poisoned") {
            return Err(ClusterError::Transient("synthetic failure".to_string()));
        }
        Ok(self.resources.lock().expect("lock poisoned").clone())
    }

    async fn scale(&self, target: &ResourceRef, replicas: u32) -> Result<(), ClusterError> {
        self.replicas
            .lock()
            .expect("lock poisoned")
            .insert(target.clone(), replicas);
        Ok(())
    }

    async fn restart(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        self.restart_calls.lock().expect("lock poisoned").push(target.clone());
        Ok(())
    }

    async fn drain(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        self.drained.lock().expect("lock poisoned").push(target.clone());
        Ok(())
    }

    async fn evict(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        self.evicted.lock().expect("lock poisoned").push(target.clone());
        Ok(())
    }

    async fn cordon_node(&self, node: &str) -> Result<(), ClusterError> {
        self.cordoned_nodes.lock().expect("lock poisoned").push(node.to_string());
        Ok(())
    }
}

/// Produces an empty snapshot timestamped `now` for an empty cluster; a
/// convenience used by tests that don't care about topology contents.
pub fn empty_snapshot() -> TopologySnapshot {
    TopologySnapshot::empty(chrono::Utc::now())
}

// A real cluster adapter implements `ClusterClient` against whatever API
// client the embedder already depends on (the trait has no Kubernetes types
// at its boundary), the same way `enforcement.rs` patches
// `Api<Deployment>`/`Api<StatefulSet>`/`Api<DaemonSet>` objects per workload
// kind. `StaticClusterClient` below is the in-process stand-in used by tests
// and `commands::check`.

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_client_returns_seeded_resources() {
        let client = StaticClusterClient::new(vec![Resource::new(ResourceRef::new(
            "Pod", "default", "a",
        ))]);
        let topo = client.get_current_topology().await.unwrap();
        assert_eq!(topo.len(), 1);
    }

    #[tokio::test]
    async fn static_client_can_simulate_failure() {
        let client = StaticClusterClient::new(vec![]);
        client.set_fail_topology(true);
        let err = client.get_current_topology().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn scale_restart_drain_evict_cordon_record_calls() {
        let client = StaticClusterClient::new(vec![]);
        let target = ResourceRef::new("Deployment", "default", "api");
        client.scale(&target, 5).await.unwrap();
        client.restart(&target).await.unwrap();
        client.drain(&target).await.unwrap();
        client.evict(&target).await.unwrap();
        client.cordon_node("node-1").await.unwrap();
        assert_eq!(client.replicas_of(&target), Some(5));
        assert_eq!(client.restart_calls(), vec![target.clone()]);
        assert_eq!(client.drained(), vec![target.clone()]);
        assert_eq!(client.evicted(), vec![target]);
        assert_eq!(client.cordoned_nodes(), vec!["node-1".to_string()]);
    }
}
