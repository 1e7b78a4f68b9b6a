mod common;

use std::sync::Arc;

use forge_hdr::circuit_breaker::{BreakerState, CircuitBreakerRegistry};
use forge_hdr::cluster_client::StaticClusterClient;
use forge_hdr::config::{CircuitBreakerConfig, OrchestrationConfig, TopologyConfig};
use forge_hdr::model::ResourceRef;
use forge_hdr::orchestration::{OrchestrationEngine, TriggerKind};
use forge_hdr::topology::TopologyAnalyzer;

#[tokio::test]
async fn repeated_restart_failures_open_the_circuit_and_stop_further_dispatch() {
    // A cluster client whose restart always fails, wrapped so the engine
    // actually observes failures rather than the static client's
    // always-succeeds default.
    struct FailingRestartClient(StaticClusterClient);

    #[async_trait::async_trait]
    impl forge_hdr::cluster_client::ClusterClient for FailingRestartClient {
        async fn get_current_topology(&self) -> Result<Vec<forge_hdr::model::Resource>, forge_hdr::error::ClusterError> {
            self.0.get_current_topology().await
        }
        async fn scale(&self, target: &ResourceRef, replicas: u32) -> Result<(), forge_hdr::error::ClusterError> {
            self.0.scale(target, replicas).await
        }
        async fn restart(&self, _target: &ResourceRef) -> Result<(), forge_hdr::error::ClusterError> {
            Err(forge_hdr::error::ClusterError::Transient("always fails in this test".to_string()))
        }
        async fn drain(&self, target: &ResourceRef) -> Result<(), forge_hdr::error::ClusterError> {
            self.0.drain(target).await
        }
        async fn evict(&self, target: &ResourceRef) -> Result<(), forge_hdr::error::ClusterError> {
            self.0.evict(target).await
        }
        async fn cordon_node(&self, node: &str) -> Result<(), forge_hdr::error::ClusterError> {
            self.0.cordon_node(node).await
        }
    }

    let bus = Arc::new(forge_hdr::bus::EventBus::new());
    let client: Arc<dyn forge_hdr::cluster_client::ClusterClient> =
        Arc::new(FailingRestartClient(StaticClusterClient::new(vec![])));
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 2,
        ..CircuitBreakerConfig::default()
    }));
    let topology = Arc::new(TopologyAnalyzer::new(TopologyConfig::default(), bus.clone(), client.clone()));
    let engine = OrchestrationEngine::new(
        OrchestrationConfig { cooldown_secs: 0, ..OrchestrationConfig::default() },
        bus,
        client,
        topology,
        breakers.clone(),
    );

    let target = ResourceRef::new("Deployment", "default", "api");
    assert!(!engine.handle_trigger(TriggerKind::HighErrorRate, &target).await);
    assert!(!engine.handle_trigger(TriggerKind::HighErrorRate, &target).await);
    assert_eq!(breakers.state(&format!("restart:{target}")), BreakerState::Open);

    // A third trigger is now blocked by the open breaker rather than
    // reaching the (still-failing) client at all.
    assert!(!engine.handle_trigger(TriggerKind::HighErrorRate, &target).await);
}
