//! Module Lifecycle Supervisor (C13): owns every other component, starts
//! and stops them in a strict order, and aggregates their health. Modeled
//! on the teacher's `ReconcileState`/`ClusterState` plus `tokio::select!`
//! shutdown dance, generalized from one long-running loop to many.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::anomaly::AnomalyDetector;
use crate::budget::BudgetEnforcer;
use crate::bus::{Event, EventBus};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::cluster_client::ClusterClient;
use crate::compliance::ComplianceChecker;
use crate::config::Config;
use crate::error::ConfigError;
use crate::health::HealthMonitor;
use crate::load_balancer::LoadBalancer;
use crate::metrics::MetricsExporter;
use crate::model::ResourceRef;
use crate::orchestration::{OrchestrationEngine, TriggerKind};
use crate::policy_optimizer::PolicyOptimizer;
use crate::profiler::PerformanceProfiler;
use crate::topology::TopologyAnalyzer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentState {
    Created,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub state: ComponentState,
    /// `true` if this is a periodically-ticking component (topology,
    /// compliance, metrics export, policy optimizer) that has gone more
    /// than 2x its configured interval without completing a tick.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub components: Vec<ComponentHealth>,
    pub healthy: bool,
}

/// The concrete component bundle the supervisor owns. Built once at
/// `Supervisor::new` and handed out via accessor methods; the periodic
/// loops (topology, metrics export) are spawned tasks tracked by their own
/// `CancellationToken`.
pub struct Supervisor {
    config: Config,
    pub bus: Arc<EventBus>,
    pub topology: Arc<TopologyAnalyzer>,
    pub compliance: Arc<ComplianceChecker>,
    pub budget: Arc<BudgetEnforcer>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub profiler: Arc<PerformanceProfiler>,
    pub anomaly: Arc<AnomalyDetector>,
    pub load_balancer: Arc<LoadBalancer>,
    pub health: Arc<HealthMonitor>,
    pub policy_optimizer: Arc<PolicyOptimizer>,
    pub orchestration: Arc<OrchestrationEngine>,
    pub metrics: Arc<MetricsExporter>,
    states: std::sync::Mutex<HashMap<&'static str, ComponentState>>,
    started: AtomicBool,
    cancel: CancellationToken,
    /// Last time each periodic component completed a tick, keyed by the
    /// same names as `START_ORDER`. Read by `health()` to flag staleness;
    /// written by `record_tick` from the background loops.
    last_tick: std::sync::Mutex<HashMap<&'static str, Instant>>,
    started_at: std::sync::Mutex<Option<Instant>>,
}

/// Start order per the external interfaces section: bus, metrics, budget,
/// circuit breakers, profiler, anomaly detector, compliance checker,
/// topology analyzer, load balancer, orchestration engine, policy
/// optimizer. Stop order is the exact reverse.
const START_ORDER: &[&str] = &[
    "bus",
    "metrics",
    "budget",
    "circuit_breaker",
    "profiler",
    "anomaly",
    "compliance",
    "topology",
    "load_balancer",
    "orchestration",
    "policy_optimizer",
];

/// Subscribes the orchestration engine to the triggers named in spec.md
/// §4.9's dispatch table: `anomaly:detected`, classified into one of the
/// four anomaly subtypes by its `type` field; `compliance:violation` at
/// `high` severity specifically on the `image-policy` check (the only
/// policy the table gives an action); and `budget:hardLimitExceeded`.
/// Neither payload carries a `ResourceRef` directly in every case, so the
/// target is derived by convention: a compliance violation always names the
/// offending resource; an anomaly's metric name is treated as a
/// `kind/namespace/name`-shaped identifier when it looks like one, and a
/// cluster-wide placeholder target otherwise.
fn install_orchestration_triggers(bus: &Arc<EventBus>, orchestration: &Arc<OrchestrationEngine>) {
    let engine = orchestration.clone();
    bus.subscribe("anomaly:detected", move |e: &Event| {
        let metric = e.field("type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let target = target_from_metric_name(&metric);
        let trigger = trigger_for_anomaly_type(&metric);
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.handle_trigger(trigger, &target).await;
        });
    });

    let engine = orchestration.clone();
    bus.subscribe("compliance:violation", move |e: &Event| {
        let severity = e.field("severity").and_then(|v| v.as_str()).unwrap_or("");
        let policy = e.field("type").and_then(|v| v.as_str()).unwrap_or("");
        if severity != "high" || policy != "image-policy" {
            return;
        }
        let Some(resource) = e
            .field("resource")
            .and_then(|v| serde_json::from_value::<ResourceRef>(v.clone()).ok())
        else {
            return;
        };
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.handle_trigger(TriggerKind::ImagePolicyViolation, &resource).await;
        });
    });

    let engine = orchestration.clone();
    bus.subscribe("budget:hardLimitExceeded", move |_e: &Event| {
        let engine = engine.clone();
        let target = ResourceRef::new("Budget", "cluster", "monthly");
        tokio::spawn(async move {
            engine.handle_trigger(TriggerKind::BudgetHardLimit, &target).await;
        });
    });
}

/// Classifies an anomaly's opaque `type` string into one of the four
/// dispatch-table subtypes. An unrecognized type (a metric name the
/// built-in anomaly vocabulary doesn't cover) falls back to
/// `HighErrorRate`'s restart action — the safest default healing action
/// when the specific cause is unknown.
fn trigger_for_anomaly_type(anomaly_type: &str) -> TriggerKind {
    let upper = anomaly_type.to_ascii_uppercase();
    if upper.contains("LATENCY") {
        TriggerKind::LatencySpike
    } else if upper.contains("CPU") {
        TriggerKind::CpuSaturation
    } else if upper.contains("MEMORY") {
        TriggerKind::MemoryPressure
    } else {
        TriggerKind::HighErrorRate
    }
}

fn target_from_metric_name(metric: &str) -> ResourceRef {
    let parts: Vec<&str> = metric.splitn(3, '/').collect();
    match parts.as_slice() {
        [kind, namespace, name] => ResourceRef::new(*kind, *namespace, *name),
        _ => ResourceRef::new("Metric", "cluster", metric),
    }
}

/// Feeds the policy optimizer's three tracked histories from the bus events
/// that already carry the relevant numbers, so the optimizer never reaches
/// into another component's internals directly.
fn install_policy_optimizer_feeds(bus: &Arc<EventBus>, optimizer: &Arc<PolicyOptimizer>) {
    let opt = optimizer.clone();
    bus.subscribe("compliance:report", move |e: &Event| {
        if let Some(count) = e.field("violationCount").and_then(|v| v.as_f64()) {
            opt.record_compliance_violation_count(count);
        }
    });

    let opt = optimizer.clone();
    bus.subscribe("anomaly:detected", move |e: &Event| {
        let metric = e.field("type").and_then(|v| v.as_str()).unwrap_or("");
        if metric != "cpu_usage_percent" {
            return;
        }
        if let Some(value) = e.field("value").and_then(|v| v.as_f64()) {
            opt.record_cpu_usage_percent(value);
        }
    });
}

impl Supervisor {
    pub fn new(config: Config, client: Arc<dyn ClusterClient>) -> Self {
        let bus = Arc::new(EventBus::new());

        // Budget and circuit breakers are constructed ahead of the metrics
        // exporter (despite starting after it) because the exporter reads
        // both at scrape time for the budget/breaker gauges.
        let budget = Arc::new(BudgetEnforcer::new(config.budget.clone(), bus.clone()));
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let metrics = MetricsExporter::new(config.metrics.clone(), bus.clone(), budget.clone(), circuit_breakers.clone());

        let profiler = Arc::new(PerformanceProfiler::new(4096));
        let anomaly = Arc::new(AnomalyDetector::new(config.anomaly.clone(), bus.clone()));
        let compliance = Arc::new(ComplianceChecker::new(config.compliance.clone(), bus.clone()));
        let topology = Arc::new(TopologyAnalyzer::new(config.topology.clone(), bus.clone(), client.clone()));
        let load_balancer = Arc::new(LoadBalancer::new());
        let health = Arc::new(HealthMonitor::new(bus.clone()));
        let orchestration = Arc::new(OrchestrationEngine::new(
            config.orchestration.clone(),
            bus.clone(),
            client,
            topology.clone(),
            circuit_breakers.clone(),
        ));
        let policy_optimizer = Arc::new(PolicyOptimizer::new(config.policy_optimizer.clone(), bus.clone()));

        budget.install_on_bus();
        load_balancer.install_on_bus(&bus);
        profiler.install_on_bus(&bus);
        install_orchestration_triggers(&bus, &orchestration);
        install_policy_optimizer_feeds(&bus, &policy_optimizer);

        let mut states = HashMap::new();
        for name in START_ORDER {
            states.insert(*name, ComponentState::Created);
        }

        Self {
            config,
            bus,
            topology,
            compliance,
            budget,
            circuit_breakers,
            profiler,
            anomaly,
            load_balancer,
            health,
            policy_optimizer,
            orchestration,
            metrics,
            states: std::sync::Mutex::new(states),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            last_tick: std::sync::Mutex::new(HashMap::new()),
            started_at: std::sync::Mutex::new(None),
        }
    }

    /// Records that `name` just completed a tick (successful or not — a
    /// retried-and-failed fetch still means the loop is alive). Called from
    /// the periodic loops spawned in `spawn_background_loops`.
    fn record_tick(&self, name: &'static str) {
        self.last_tick.lock().expect("supervisor lock poisoned").insert(name, Instant::now());
    }

    /// Tick interval for the periodic components named in `START_ORDER`, or
    /// `None` for components that are purely event-driven and never go
    /// stale on their own schedule.
    fn periodic_interval_secs(&self, name: &str) -> Option<u64> {
        match name {
            "topology" => Some(self.config.topology.analysis_interval_secs.max(1)),
            // the compliance sweep runs off the topology tick (`analysisComplete`),
            // so it shares the same cadence rather than having its own.
            "compliance" => Some(self.config.topology.analysis_interval_secs.max(1)),
            "metrics" => Some(self.config.metrics.export_interval_secs.max(1)),
            "policy_optimizer" => Some(self.config.policy_optimizer.optimization_interval_secs.max(1)),
            _ => None,
        }
    }

    /// Validates the configuration, then marks every component started, in
    /// `START_ORDER`. A validation failure aborts before any component
    /// transitions out of `Created` — there is nothing to reverse-unwind
    /// since nothing has started yet.
    pub fn start(self: &Arc<Self>) -> Result<(), ConfigError> {
        self.config.validate()?;

        let mut states = self.states.lock().expect("supervisor lock poisoned");
        for name in START_ORDER {
            states.insert(*name, ComponentState::Started);
        }
        drop(states);
        *self.started_at.lock().expect("supervisor lock poisoned") = Some(Instant::now());
        self.last_tick.lock().expect("supervisor lock poisoned").clear();
        self.started.store(true, Ordering::SeqCst);
        tracing::info!("supervisor_started");
        Ok(())
    }

    pub fn spawn_background_loops(self: &Arc<Self>) {
        let topology = self.topology.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { topology.spawn_loop(cancel).await });

        // `analysisComplete`/`analysisFailed` both mean the topology loop is
        // alive and ticking, so both count toward its liveness.
        let sup_for_topology = Arc::clone(self);
        self.bus.subscribe("analysisComplete", move |_| sup_for_topology.record_tick("topology"));
        let sup_for_topology = Arc::clone(self);
        self.bus.subscribe("analysisFailed", move |_| sup_for_topology.record_tick("topology"));

        let metrics = self.metrics.clone();
        let sup_for_metrics = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(metrics.export_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        metrics.export_once();
                        sup_for_metrics.record_tick("metrics");
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });

        // Every analysis tick, re-run the compliance sweep against the
        // snapshot the topology analyzer just produced, matching the
        // "topology/compliance publish findings, orchestration reacts"
        // control flow.
        let compliance = self.compliance.clone();
        let topology_for_compliance = self.topology.clone();
        let sup_for_compliance = Arc::clone(self);
        self.bus.subscribe("analysisComplete", move |_| {
            let compliance = compliance.clone();
            let sup = sup_for_compliance.clone();
            let resources = topology_for_compliance.snapshot().resources.clone();
            tokio::spawn(async move {
                compliance.evaluate(&resources).await;
                sup.record_tick("compliance");
            });
        });

        let policy_optimizer = self.policy_optimizer.clone();
        let profiler = self.profiler.clone();
        let budget = self.budget.clone();
        let sup_for_optimizer = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval_secs = self.config.policy_optimizer.optimization_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(p95) = profiler.percentile(0.95) {
                            policy_optimizer.record_latency_p95(p95);
                        }
                        let status = budget.status();
                        if status.monthly_limit > 0.0 {
                            policy_optimizer.record_budget_percent_used(100.0 * status.monthly_spent / status.monthly_limit);
                        }
                        policy_optimizer.analyze();
                        sup_for_optimizer.record_tick("policy_optimizer");
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Stops every component in reverse start order and cancels the
    /// background loops.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut states = self.states.lock().expect("supervisor lock poisoned");
        for name in START_ORDER.iter().rev() {
            states.insert(*name, ComponentState::Stopped);
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("supervisor_stopped");
    }

    /// Aggregate health for `/health/ready`: every component must be
    /// `Started`, and every periodic component must have completed a tick
    /// within 2x its configured interval (measured from the last tick, or
    /// from `start()` if it hasn't ticked yet — so readiness during the
    /// first interval after boot is not penalized).
    pub fn health(&self) -> SystemHealth {
        let states = self.states.lock().expect("supervisor lock poisoned");
        let last_tick = self.last_tick.lock().expect("supervisor lock poisoned");
        let started_at = *self.started_at.lock().expect("supervisor lock poisoned");
        let components: Vec<ComponentHealth> = START_ORDER
            .iter()
            .map(|name| {
                let state = states[name];
                let stale = state == ComponentState::Started
                    && self.periodic_interval_secs(name).is_some_and(|interval_secs| {
                        let reference = last_tick.get(name).copied().or(started_at);
                        reference.is_some_and(|at| at.elapsed() > Duration::from_secs(2 * interval_secs))
                    });
                ComponentHealth { name, state, stale }
            })
            .collect();
        let healthy = components.iter().all(|c| c.state == ComponentState::Started && !c.stale);
        SystemHealth { components, healthy }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_client::StaticClusterClient;

    fn supervisor() -> Arc<Supervisor> {
        Arc::new(Supervisor::new(Config::default(), Arc::new(StaticClusterClient::new(vec![]))))
    }

    #[test]
    fn health_is_unhealthy_before_start_and_healthy_after() {
        let sup = supervisor();
        assert!(!sup.health().healthy);
        sup.start().expect("config is valid");
        assert!(sup.health().healthy);
    }

    #[test]
    fn an_invalid_config_aborts_start_leaving_every_component_created() {
        let mut config = Config::default();
        config.metrics.export_interval_secs = 0;
        let sup = Arc::new(Supervisor::new(config, Arc::new(StaticClusterClient::new(vec![]))));
        assert!(sup.start().is_err());
        assert!(sup.health().components.iter().all(|c| c.state == ComponentState::Created));
        assert!(!sup.is_running());
    }

    #[test]
    fn stop_reverses_every_component_to_stopped() {
        let sup = supervisor();
        sup.start().expect("config is valid");
        sup.stop();
        let health = sup.health();
        assert!(!health.healthy);
        assert!(health.components.iter().all(|c| c.state == ComponentState::Stopped));
    }

    #[test]
    fn components_start_in_the_documented_order() {
        let components = Supervisor::new(Config::default(), Arc::new(StaticClusterClient::new(vec![]))).health().components;
        let names: Vec<&str> = components.iter().map(|c| c.name).collect();
        assert_eq!(names, START_ORDER.to_vec());
    }

    #[test]
    fn ready_goes_stale_once_a_periodic_component_misses_two_intervals() {
        let sup = supervisor();
        sup.start().expect("config is valid");
        assert!(sup.health().healthy);

        // Backdate the boot clock past 2x every periodic component's
        // interval without any tick ever having landed, simulating a loop
        // that silently stopped ticking.
        *sup.started_at.lock().unwrap() = Some(Instant::now() - Duration::from_secs(10_000));
        let health = sup.health();
        assert!(!health.healthy);
        let topology = health.components.iter().find(|c| c.name == "topology").unwrap();
        assert!(topology.stale);
    }

    #[test]
    fn a_fresh_tick_clears_staleness() {
        let sup = supervisor();
        sup.start().expect("config is valid");
        *sup.started_at.lock().unwrap() = Some(Instant::now() - Duration::from_secs(10_000));
        assert!(!sup.health().healthy);

        sup.record_tick("topology");
        sup.record_tick("compliance");
        sup.record_tick("metrics");
        sup.record_tick("policy_optimizer");
        assert!(sup.health().healthy);
    }
}
