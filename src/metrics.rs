//! Metrics Exporter (C12): subscribes to every bus topic named in the
//! external interfaces section and keeps a Prometheus registry plus a
//! bounded JSON snapshot ring, following the teacher's per-metric
//! `LazyLock` pattern from its reconcile command, scoped per instance
//! rather than process-global so that two supervisors (or two tests) in
//! one process never share counters.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde_json::{json, Value};

use crate::budget::BudgetEnforcer;
use crate::bus::EventBus;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::MetricsConfig;
use crate::model::HistoryRing;
use crate::profiler::BUCKET_BOUNDS;

struct Counters {
    requests_total: IntCounter,
    requests_success: IntCounter,
    requests_failed: IntCounter,
    pods_created: IntCounter,
    pods_deleted: IntCounter,
    costs_incurred: Counter,
    violations_detected: IntCounter,
    anomalies_detected: IntCounter,
    healing_operations: IntCounter,
    active_pods: IntGauge,
    cpu_usage_percent: Gauge,
    memory_usage_percent: Gauge,
    network_latency_ms: Gauge,
    budget_utilized_percent: Gauge,
    circuit_breaker_open_count: IntGauge,
    request_latency_seconds: Histogram,
}

impl Counters {
    fn new(registry: &Registry) -> Self {
        let int_counter = |name: &str, help: &str| -> IntCounter {
            let c = IntCounter::new(name, help).expect("metric definition is valid");
            registry.register(Box::new(c.clone())).expect("metric registration is valid");
            c
        };
        let counter = |name: &str, help: &str| -> Counter {
            let c = Counter::new(name, help).expect("metric definition is valid");
            registry.register(Box::new(c.clone())).expect("metric registration is valid");
            c
        };
        let int_gauge = |name: &str, help: &str| -> IntGauge {
            let g = IntGauge::new(name, help).expect("metric definition is valid");
            registry.register(Box::new(g.clone())).expect("metric registration is valid");
            g
        };
        let gauge = |name: &str, help: &str| -> Gauge {
            let g = Gauge::new(name, help).expect("metric definition is valid");
            registry.register(Box::new(g.clone())).expect("metric registration is valid");
            g
        };

        let buckets: Vec<f64> = BUCKET_BOUNDS.iter().copied().filter(|b| b.is_finite()).collect();
        let opts = HistogramOpts::new("request_latency_seconds", "request:completed duration, seconds").buckets(buckets);
        let request_latency_seconds = Histogram::with_opts(opts).expect("metric definition is valid");
        registry
            .register(Box::new(request_latency_seconds.clone()))
            .expect("metric registration is valid");

        Self {
            requests_total: int_counter("requests_total", "Requests observed via request:completed"),
            requests_success: int_counter("requests_success", "Requests completed with a non-error status"),
            requests_failed: int_counter("requests_failed", "Requests completed with an error status"),
            pods_created: int_counter("pods_created", "pod:created events observed"),
            pods_deleted: int_counter("pods_deleted", "pod:deleted events observed"),
            costs_incurred: counter("costs_incurred", "Cumulative cost observed via cost:incurred"),
            violations_detected: int_counter("violations_detected", "compliance:violation events observed"),
            anomalies_detected: int_counter("anomalies_detected", "anomaly:detected events observed"),
            healing_operations: int_counter("healing_operations", "healing:triggered/completed/failed events observed"),
            active_pods: int_gauge("active_pods", "Pods currently tracked as live"),
            cpu_usage_percent: gauge("cpu_usage_percent", "Most recently observed cpu_usage_percent anomaly sample"),
            memory_usage_percent: gauge("memory_usage_percent", "Most recently observed memory_usage_percent anomaly sample"),
            network_latency_ms: gauge("network_latency_ms", "Most recently observed network_latency_ms anomaly sample"),
            budget_utilized_percent: gauge("budget_utilized_percent", "Monthly budget spent, as a percentage of the monthly limit"),
            circuit_breaker_open_count: int_gauge("circuit_breaker_open_count", "Circuit breaker targets currently open"),
            request_latency_seconds,
        }
    }
}

/// Subscribes to every topic named in the external interfaces section and
/// keeps a bounded ring of JSON snapshots alongside the Prometheus
/// counters, so `/metrics/json` and `/metrics` stay consistent with each
/// other. Holds live references to the budget ledger and circuit breaker
/// registry so `budget_utilized_percent` and `circuit_breaker_open_count`
/// always reflect current state at scrape time, not just the last tick.
///
/// Each instance owns its own `Registry`: a process that runs several
/// supervisors (or a test suite that constructs several exporters) never
/// shares counters between them.
pub struct MetricsExporter {
    config: MetricsConfig,
    registry: Registry,
    counters: Counters,
    budget: Arc<BudgetEnforcer>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    snapshots: Mutex<HistoryRing<Value>>,
    started_at: chrono::DateTime<Utc>,
}

impl MetricsExporter {
    pub fn new(
        config: MetricsConfig,
        bus: Arc<EventBus>,
        budget: Arc<BudgetEnforcer>,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
    ) -> Arc<Self> {
        let registry = Registry::new();
        let counters = Counters::new(&registry);
        let exporter = Arc::new(Self {
            snapshots: Mutex::new(HistoryRing::new(config.snapshot_history)),
            started_at: Utc::now(),
            config,
            registry,
            counters,
            budget,
            circuit_breakers,
        });

        let this = exporter.clone();
        bus.subscribe("request:completed", move |e| {
            this.counters.requests_total.inc();
            let status = e.field("status").and_then(|v| v.as_i64()).unwrap_or(200);
            if status >= 400 {
                this.counters.requests_failed.inc();
            } else {
                this.counters.requests_success.inc();
            }
            if let Some(duration_ms) = e.field("duration").and_then(|v| v.as_f64()) {
                this.counters.request_latency_seconds.observe(duration_ms / 1000.0);
            }
        });
        let this = exporter.clone();
        bus.subscribe("pod:created", move |_| {
            this.counters.pods_created.inc();
            this.counters.active_pods.inc();
        });
        let this = exporter.clone();
        bus.subscribe("pod:deleted", move |_| {
            this.counters.pods_deleted.inc();
            this.counters.active_pods.dec();
        });
        let this = exporter.clone();
        bus.subscribe("cost:incurred", move |e| {
            if let Some(cost) = e.field("cost").and_then(|v| v.as_f64()) {
                this.counters.costs_incurred.inc_by(cost);
            }
        });
        let this = exporter.clone();
        bus.subscribe("compliance:violation", move |_| this.counters.violations_detected.inc());
        let this = exporter.clone();
        bus.subscribe("anomaly:detected", move |e| {
            this.counters.anomalies_detected.inc();
            if let (Some(kind), Some(value)) = (e.field("type").and_then(|v| v.as_str()), e.field("value").and_then(|v| v.as_f64())) {
                match kind {
                    "cpu_usage_percent" => this.counters.cpu_usage_percent.set(value),
                    "memory_usage_percent" => this.counters.memory_usage_percent.set(value),
                    "network_latency_ms" => this.counters.network_latency_ms.set(value),
                    _ => {}
                }
            }
        });
        let this = exporter.clone();
        bus.subscribe("healing:triggered", move |_| this.counters.healing_operations.inc());
        let this = exporter.clone();
        bus.subscribe("healing:completed", move |_| this.counters.healing_operations.inc());
        let this = exporter.clone();
        bus.subscribe("healing:failed", move |_| this.counters.healing_operations.inc());
        let this = exporter.clone();
        bus.subscribe("budget:alertThresholdExceeded", move |e| {
            if let Some(percent) = e.field("percentUsed").and_then(|v| v.as_f64()) {
                this.counters.budget_utilized_percent.set(percent);
            }
        });

        exporter
    }

    /// Re-derives gauges that are cheaper to compute on demand than to keep
    /// live on every event: budget utilization and open breaker count.
    /// Called before every scrape and on every periodic export tick.
    fn refresh_gauges(&self) {
        let status = self.budget.status();
        if status.monthly_limit > 0.0 {
            self.counters.budget_utilized_percent.set(100.0 * status.monthly_spent / status.monthly_limit);
        }
        self.counters.circuit_breaker_open_count.set(self.circuit_breakers.open_count() as i64);
    }

    pub fn render_prometheus_text(&self) -> String {
        self.refresh_gauges();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer).expect("encoding registered metrics never fails");
        String::from_utf8(buffer).expect("prometheus text encoder always emits valid utf-8")
    }

    /// Takes a JSON snapshot of the current counter values and pushes it
    /// onto the bounded history ring. Called on `exportInterval`.
    pub fn export_once(&self) {
        self.refresh_gauges();
        let snapshot = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "uptimeSeconds": (Utc::now() - self.started_at).num_seconds(),
            "metrics": {
                "requestsTotal": self.counters.requests_total.get(),
                "requestsSuccess": self.counters.requests_success.get(),
                "requestsFailed": self.counters.requests_failed.get(),
                "podsCreated": self.counters.pods_created.get(),
                "podsDeleted": self.counters.pods_deleted.get(),
                "costsIncurred": self.counters.costs_incurred.get(),
                "violationsDetected": self.counters.violations_detected.get(),
                "anomaliesDetected": self.counters.anomalies_detected.get(),
                "healingOperations": self.counters.healing_operations.get(),
                "activePods": self.counters.active_pods.get(),
                "budgetUtilizedPercent": self.counters.budget_utilized_percent.get(),
                "circuitBreakerOpenCount": self.counters.circuit_breaker_open_count.get(),
            },
            "systemInfo": { "crate": "forge-hdr", "version": env!("CARGO_PKG_VERSION") },
        });
        self.snapshots.lock().expect("metrics lock poisoned").push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<Value> {
        self.snapshots.lock().expect("metrics lock poisoned").last_n(1).into_iter().next().cloned()
    }

    pub fn export_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.export_interval_secs)
    }
}
