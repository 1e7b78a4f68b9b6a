//! Load Balancer (C6): tracks live pods per namespace and hands out a
//! weighted-random selection, excluding any pod currently draining.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::model::ResourceRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPod {
    pub reference: ResourceRef,
    pub score: f64,
    pub draining: bool,
}

/// One mutex over the whole namespace map; selection reads the map and
/// rolls a weighted random index without ever holding the lock across an
/// external call (there is none here — selection is pure once the snapshot
/// is taken).
pub struct LoadBalancer {
    pods: Mutex<HashMap<String, Vec<TrackedPod>>>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self { pods: Mutex::new(HashMap::new()) }
    }

    pub fn pod_created(&self, namespace: &str, reference: ResourceRef) {
        let mut pods = self.pods.lock().expect("load balancer lock poisoned");
        pods.entry(namespace.to_string()).or_default().push(TrackedPod {
            reference,
            score: 1.0,
            draining: false,
        });
    }

    pub fn pod_deleted(&self, namespace: &str, reference: &ResourceRef) {
        let mut pods = self.pods.lock().expect("load balancer lock poisoned");
        if let Some(list) = pods.get_mut(namespace) {
            list.retain(|p| &p.reference != reference);
        }
    }

    pub fn set_draining(&self, namespace: &str, reference: &ResourceRef, draining: bool) {
        let mut pods = self.pods.lock().expect("load balancer lock poisoned");
        if let Some(list) = pods.get_mut(namespace) {
            if let Some(pod) = list.iter_mut().find(|p| &p.reference == reference) {
                pod.draining = draining;
            }
        }
    }

    pub fn set_score(&self, namespace: &str, reference: &ResourceRef, score: f64) {
        let mut pods = self.pods.lock().expect("load balancer lock poisoned");
        if let Some(list) = pods.get_mut(namespace) {
            if let Some(pod) = list.iter_mut().find(|p| &p.reference == reference) {
                pod.score = score;
            }
        }
    }

    /// Weighted-random selection among non-draining pods in `namespace`.
    /// Returns `None` if the namespace is empty or every pod is draining.
    pub fn select_pod(&self, namespace: &str) -> Option<ResourceRef> {
        let pods = self.pods.lock().expect("load balancer lock poisoned");
        let candidates: Vec<&TrackedPod> = pods
            .get(namespace)?
            .iter()
            .filter(|p| !p.draining && p.score > 0.0)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let total: f64 = candidates.iter().map(|p| p.score).sum();
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for pod in &candidates {
            if roll < pod.score {
                return Some(pod.reference.clone());
            }
            roll -= pod.score;
        }
        candidates.last().map(|p| p.reference.clone())
    }

    pub fn pod_count(&self, namespace: &str) -> usize {
        self.pods
            .lock()
            .expect("load balancer lock poisoned")
            .get(namespace)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Total tracked pods across every namespace, backing the `active_pods`
    /// gauge.
    pub fn total_count(&self) -> usize {
        self.pods.lock().expect("load balancer lock poisoned").values().map(|l| l.len()).sum()
    }

    /// Subscribes to `pod:created {ref}` / `pod:deleted {ref}`, where `ref`
    /// is a `ResourceRef` (`{kind, namespace, name}`).
    pub fn install_on_bus(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let this = self.clone();
        bus.subscribe("pod:created", move |e| {
            if let Some(reference) = e.field("ref").and_then(|v| serde_json::from_value::<ResourceRef>(v.clone()).ok()) {
                this.pod_created(&reference.namespace, reference);
            }
        });
        let this = self.clone();
        bus.subscribe("pod:deleted", move |e| {
            if let Some(reference) = e.field("ref").and_then(|v| serde_json::from_value::<ResourceRef>(v.clone()).ok()) {
                this.pod_deleted(&reference.namespace, &reference);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str) -> ResourceRef {
        ResourceRef::new("Pod", "default", name)
    }

    #[test]
    fn select_pod_skips_draining_pods() {
        let lb = LoadBalancer::new();
        lb.pod_created("default", pod("a"));
        lb.pod_created("default", pod("b"));
        lb.set_draining("default", &pod("a"), true);
        for _ in 0..20 {
            assert_eq!(lb.select_pod("default"), Some(pod("b")));
        }
    }

    #[test]
    fn select_pod_returns_none_when_all_draining() {
        let lb = LoadBalancer::new();
        lb.pod_created("default", pod("a"));
        lb.set_draining("default", &pod("a"), true);
        assert_eq!(lb.select_pod("default"), None);
    }

    #[test]
    fn select_pod_returns_none_for_empty_namespace() {
        let lb = LoadBalancer::new();
        assert_eq!(lb.select_pod("default"), None);
    }

    #[test]
    fn pod_deleted_removes_it_from_selection() {
        let lb = LoadBalancer::new();
        lb.pod_created("default", pod("a"));
        lb.pod_deleted("default", &pod("a"));
        assert_eq!(lb.pod_count("default"), 0);
    }

    #[test]
    fn higher_score_pods_are_selected_more_often() {
        let lb = LoadBalancer::new();
        lb.pod_created("default", pod("a"));
        lb.pod_created("default", pod("b"));
        lb.set_score("default", &pod("a"), 99.0);
        lb.set_score("default", &pod("b"), 1.0);
        let mut a_count = 0;
        for _ in 0..200 {
            if lb.select_pod("default") == Some(pod("a")) {
                a_count += 1;
            }
        }
        assert!(a_count > 150, "expected heavily weighted pod to dominate selection, got {a_count}/200");
    }
}
