//! The full configuration surface from the external interfaces section:
//! one `Config` struct, serde-deserializable from YAML/JSON and
//! `clap`-overridable on the command line, following the teacher's pattern
//! of small `*Config` structs with explicit defaults resolved at use-site
//! (`DefaultProbeConfig`, `DefaultResourceConfig` in the original `crd.rs`).

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub topology: TopologyConfig,
    pub compliance: ComplianceConfig,
    pub budget: BudgetConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub anomaly: AnomalyConfig,
    pub orchestration: OrchestrationConfig,
    pub policy_optimizer: PolicyOptimizerConfig,
    pub metrics: MetricsConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            compliance: ComplianceConfig::default(),
            budget: BudgetConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            anomaly: AnomalyConfig::default(),
            orchestration: OrchestrationConfig::default(),
            policy_optimizer: PolicyOptimizerConfig::default(),
            metrics: MetricsConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Rejects configurations that would panic a periodic loop (a
    /// zero-second `tokio::time::interval`), make a threshold
    /// mathematically meaningless, or fail to bind a socket address. Run
    /// once at `Supervisor::start` so a bad config aborts startup instead
    /// of surfacing as a panic or silent no-op deep in a background task.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require(cond: bool, field: &str, reason: &str) -> Result<(), ConfigError> {
            if cond {
                Ok(())
            } else {
                Err(ConfigError::Invalid { field: field.to_string(), reason: reason.to_string() })
            }
        }

        require(
            self.topology.analysis_interval_secs > 0,
            "topology.analysis_interval_secs",
            "must be greater than zero",
        )?;
        require(
            self.metrics.export_interval_secs > 0,
            "metrics.export_interval_secs",
            "must be greater than zero",
        )?;
        require(
            self.policy_optimizer.optimization_interval_secs > 0,
            "policy_optimizer.optimization_interval_secs",
            "must be greater than zero",
        )?;
        require(
            self.metrics.bind_addr.parse::<std::net::SocketAddr>().is_ok(),
            "metrics.bind_addr",
            "must be a valid host:port socket address",
        )?;
        require(self.budget.monthly_limit >= 0.0, "budget.monthly_limit", "must be non-negative")?;
        require(self.budget.daily_limit >= 0.0, "budget.daily_limit", "must be non-negative")?;
        require(
            (0.0..=1.0).contains(&self.budget.alert_threshold_fraction),
            "budget.alert_threshold_fraction",
            "must be between 0.0 and 1.0",
        )?;
        require(
            self.budget.hard_limit_fraction >= self.budget.alert_threshold_fraction,
            "budget.hard_limit_fraction",
            "must be >= alert_threshold_fraction",
        )?;
        require(
            self.circuit_breaker.failure_threshold > 0,
            "circuit_breaker.failure_threshold",
            "must be greater than zero",
        )?;
        require(
            self.circuit_breaker.max_backoff_secs >= self.circuit_breaker.base_backoff_secs,
            "circuit_breaker.max_backoff_secs",
            "must be >= base_backoff_secs",
        )?;
        require(self.anomaly.window_size >= 2, "anomaly.window_size", "must be at least 2")?;
        require(self.anomaly.threshold > 0.0, "anomaly.threshold", "must be greater than zero")?;
        require(
            self.orchestration.scale_up_factor > 1.0,
            "orchestration.scale_up_factor",
            "must be greater than 1.0 to actually scale up",
        )?;
        require(
            self.orchestration.max_actions_per_window > 0,
            "orchestration.max_actions_per_window",
            "must be greater than zero",
        )?;
        require(
            self.orchestration.action_window_secs > 0,
            "orchestration.action_window_secs",
            "must be greater than zero",
        )?;
        require(
            (0.0..=1.0).contains(&self.policy_optimizer.auto_apply_confidence_threshold),
            "policy_optimizer.auto_apply_confidence_threshold",
            "must be between 0.0 and 1.0",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub analysis_interval_secs: u64,
    pub depth_limit: usize,
    pub bottleneck_threshold: usize,
    pub per_call_deadline_secs: u64,
    pub max_retries: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            analysis_interval_secs: 30,
            depth_limit: 10,
            bottleneck_threshold: 5,
            per_call_deadline_secs: 10,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub policy_check_timeout_ms: u64,
    pub history_retention: usize,
    pub image_allow_list: Option<Vec<String>>,
    pub max_restart_count: u32,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            policy_check_timeout_ms: 250,
            history_retention: 1000,
            image_allow_list: None,
            max_restart_count: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub monthly_limit: f64,
    pub daily_limit: f64,
    pub alert_threshold_fraction: f64,
    pub hard_limit_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit: 10_000.0,
            daily_limit: 500.0,
            alert_threshold_fraction: 0.8,
            hard_limit_fraction: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub window_size: usize,
    pub threshold: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub cooldown_secs: u64,
    /// Multiplier applied to a target's current replica count for a
    /// scale-up dispatch (LATENCY_SPIKE/CPU_SATURATION/MEMORY_PRESSURE).
    pub scale_up_factor: f64,
    /// The "K" in "restart affected pods (up to K per window)": a global
    /// cap on healing actions dispatched within `action_window_secs`,
    /// independent of the per-target cooldown.
    pub max_actions_per_window: u32,
    pub action_window_secs: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            scale_up_factor: 2.0,
            max_actions_per_window: 3,
            action_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOptimizerConfig {
    pub optimization_interval_secs: u64,
    pub auto_apply_confidence_threshold: f64,
}

impl Default for PolicyOptimizerConfig {
    fn default() -> Self {
        Self {
            optimization_interval_secs: 3600,
            auto_apply_confidence_threshold: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub export_interval_secs: u64,
    pub bind_addr: String,
    pub snapshot_history: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            export_interval_secs: 15,
            bind_addr: "0.0.0.0:9090".to_string(),
            snapshot_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub auto_apply: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { auto_apply: false }
    }
}
