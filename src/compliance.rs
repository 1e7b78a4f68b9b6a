//! Compliance Checker (C4): a registry of named policies evaluated against
//! every resource in the latest topology snapshot. Each check is raced
//! against a timeout so one slow/misbehaving policy can't stall the whole
//! sweep (a timeout becomes a failed check, never a process-wide error).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::{Event, EventBus};
use crate::config::ComplianceConfig;
use crate::model::{HistoryRing, Resource, ResourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    fn weight(self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub passed: bool,
    pub issues: Vec<String>,
}

impl PolicyCheck {
    fn ok() -> Self {
        Self { passed: true, issues: Vec::new() }
    }

    fn fail(issue: impl Into<String>) -> Self {
        Self { passed: false, issues: vec![issue.into()] }
    }
}

pub struct Policy {
    pub name: &'static str,
    pub severity: Severity,
    pub enabled: bool,
    pub check: Box<dyn Fn(&Resource, &ComplianceConfig) -> PolicyCheck + Send + Sync>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub resource: ResourceRef,
    pub checks: HashMap<String, PolicyCheck>,
    pub violations_by_severity: HashMap<String, u32>,
    pub average_severity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub results: Vec<ComplianceResult>,
    pub violations_by_severity: HashMap<String, u32>,
}

/// Default registry allow-list for the `image-policy` check, used whenever
/// `ComplianceConfig::image_allow_list` is not set. A configured list
/// overrides this default rather than merging with it.
pub const DEFAULT_IMAGE_ALLOW_LIST: &[&str] = &["gcr.io", "docker.io/library", "quay.io"];

/// The eight built-in policies, in declaration order for deterministic test
/// output. Registered by name so the optimizer and CLI can reference them.
pub fn builtin_policies() -> Vec<Policy> {
    vec![
        Policy {
            name: "resource-limits",
            severity: Severity::High,
            enabled: true,
            check: Box::new(|r, _cfg| {
                if r.cpu_limit_millis.is_none() || r.memory_limit_gib.is_none() {
                    PolicyCheck::fail("missing cpu or memory limit")
                } else {
                    PolicyCheck::ok()
                }
            }),
        },
        Policy {
            name: "resource-requests",
            severity: Severity::Medium,
            enabled: true,
            check: Box::new(|r, _cfg| {
                if r.cpu_request_millis.is_none() || r.memory_request_gib.is_none() {
                    PolicyCheck::fail("missing cpu or memory request")
                } else {
                    PolicyCheck::ok()
                }
            }),
        },
        Policy {
            name: "security-context",
            severity: Severity::High,
            enabled: true,
            check: Box::new(|r, _cfg| {
                if r.privileged == Some(true) {
                    PolicyCheck::fail("container runs privileged")
                } else if r.run_as_non_root != Some(true) {
                    PolicyCheck::fail("missing runAsNonRoot")
                } else if r.read_only_root_filesystem != Some(true) {
                    PolicyCheck::fail("missing readOnlyRootFilesystem")
                } else {
                    PolicyCheck::ok()
                }
            }),
        },
        Policy {
            name: "health-checks",
            severity: Severity::Medium,
            enabled: true,
            check: Box::new(|r, _cfg| {
                if !r.has_liveness_probe || !r.has_readiness_probe {
                    PolicyCheck::fail("missing liveness or readiness probe")
                } else {
                    PolicyCheck::ok()
                }
            }),
        },
        Policy {
            name: "image-policy",
            severity: Severity::High,
            enabled: true,
            check: Box::new(|r, cfg| {
                let Some(image) = r.image.as_deref() else {
                    return PolicyCheck::fail("no image specified");
                };
                if image.ends_with(":latest") || !image.contains(':') {
                    return PolicyCheck::fail("image uses a floating or missing tag");
                }
                let allowed = match &cfg.image_allow_list {
                    Some(allow_list) => allow_list.iter().any(|prefix| image.starts_with(prefix)),
                    None => DEFAULT_IMAGE_ALLOW_LIST.iter().any(|prefix| image.starts_with(prefix)),
                };
                if !allowed {
                    return PolicyCheck::fail("image is not on the allow list");
                }
                PolicyCheck::ok()
            }),
        },
        Policy {
            name: "replica-policy",
            severity: Severity::Medium,
            enabled: true,
            check: Box::new(|r, _cfg| match r.replicas {
                Some(n) if n >= 2 => PolicyCheck::ok(),
                Some(_) => PolicyCheck::fail("fewer than two replicas"),
                None => PolicyCheck::ok(),
            }),
        },
        Policy {
            name: "network-policy",
            severity: Severity::Medium,
            enabled: true,
            check: Box::new(|r, _cfg| {
                if r.network_policy_attached {
                    PolicyCheck::ok()
                } else {
                    PolicyCheck::fail("no network policy attached")
                }
            }),
        },
        Policy {
            name: "resource-ratio",
            severity: Severity::Low,
            enabled: true,
            check: Box::new(|r, _cfg| match (r.memory_request_gib, r.memory_limit_gib) {
                (Some(req), Some(limit)) if limit < 2.0 * req => {
                    PolicyCheck::fail("memory limit is less than 2x the memory request")
                }
                _ => PolicyCheck::ok(),
            }),
        },
    ]
}

/// Owns the live policy registry and per-resource compliance history.
pub struct ComplianceChecker {
    policies: RwLock<HashMap<String, Policy>>,
    config: ComplianceConfig,
    bus: Arc<EventBus>,
    history: std::sync::Mutex<HistoryRing<ComplianceSummary>>,
}

impl ComplianceChecker {
    pub fn new(config: ComplianceConfig, bus: Arc<EventBus>) -> Self {
        let mut map = HashMap::new();
        for policy in builtin_policies() {
            map.insert(policy.name.to_string(), policy);
        }
        Self {
            policies: RwLock::new(map),
            history: std::sync::Mutex::new(HistoryRing::new(config.history_retention)),
            config,
            bus,
        }
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        if let Some(p) = self.policies.write().expect("policy lock poisoned").get_mut(name) {
            p.enabled = enabled;
        }
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.policies.read().expect("policy lock poisoned").keys().cloned().collect()
    }

    /// Evaluates every enabled policy against every resource. Each
    /// individual check is raced against `policyCheckTimeout`; a timeout
    /// becomes a failed check rather than aborting the sweep.
    pub async fn evaluate(&self, resources: &[Resource]) -> ComplianceSummary {
        let deadline = std::time::Duration::from_millis(self.config.policy_check_timeout_ms);
        let mut results = Vec::with_capacity(resources.len());
        let mut totals: HashMap<String, u32> = HashMap::new();

        for resource in resources {
            let mut checks = HashMap::new();
            let mut resource_violations: HashMap<String, u32> = HashMap::new();
            let mut severity_sum = 0u32;
            let mut severity_count = 0u32;
            let snapshot: Vec<(String, Severity, bool)> = {
                let policies = self.policies.read().expect("policy lock poisoned");
                policies
                    .values()
                    .filter(|p| p.enabled)
                    .map(|p| (p.name.to_string(), p.severity, true))
                    .collect()
            };
            for (name, severity, _) in snapshot {
                let config = self.config.clone();
                let result = tokio::time::timeout(deadline, async {
                    let policies = self.policies.read().expect("policy lock poisoned");
                    let policy = policies.get(&name).expect("policy present during evaluation");
                    (policy.check)(resource, &config)
                })
                .await
                .unwrap_or_else(|_| PolicyCheck::fail("timeout"));

                if !result.passed {
                    *totals.entry(severity_label(severity).to_string()).or_insert(0) += 1;
                    *resource_violations.entry(severity_label(severity).to_string()).or_insert(0) += 1;
                    severity_sum += severity.weight();
                    severity_count += 1;
                    self.bus.publish(Event::new(
                        "compliance:violation",
                        json!({
                            "resource": resource.reference,
                            "type": name,
                            "severity": severity_label(severity),
                        }),
                    ));
                }
                checks.insert(name, result);
            }

            let average_severity = if severity_count > 0 {
                severity_sum as f64 / severity_count as f64
            } else {
                0.0
            };

            results.push(ComplianceResult {
                resource: resource.reference.clone(),
                checks,
                violations_by_severity: resource_violations,
                average_severity,
            });
        }

        let summary = ComplianceSummary {
            taken_at: chrono::Utc::now(),
            results,
            violations_by_severity: totals.clone(),
        };

        self.history.lock().expect("history lock poisoned").push(summary.clone());

        if totals.get("high").copied().unwrap_or(0) > 0 {
            self.bus.publish(Event::new(
                "compliance:criticalViolations",
                json!({ "highSeverityCount": totals.get("high").copied().unwrap_or(0) }),
            ));
        }

        let violation_count: u32 = totals.values().sum();
        let resources_checked = summary.results.len();
        let total_checks: usize = summary.results.iter().map(|r| r.checks.len()).sum();
        let compliance_rate = if total_checks > 0 {
            1.0 - (violation_count as f64 / total_checks as f64)
        } else {
            1.0
        };
        self.bus.publish(Event::new(
            "compliance:report",
            json!({
                "violationCount": violation_count,
                "resourcesChecked": resources_checked,
                "complianceRate": compliance_rate,
            }),
        ));

        summary
    }

    pub fn history_snapshot(&self, n: usize) -> Vec<ComplianceSummary> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .last_n(n)
            .into_iter()
            .cloned()
            .collect()
    }
}

fn severity_label(s: Severity) -> &'static str {
    match s {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_resource() -> Resource {
        let mut r = Resource::new(ResourceRef::new("Pod", "default", "web"));
        r.cpu_request_millis = Some(100);
        r.cpu_limit_millis = Some(500);
        r.memory_request_gib = Some(0.125);
        r.memory_limit_gib = Some(0.25);
        r.image = Some("gcr.io/example/web:1.2.3".to_string());
        r.replicas = Some(3);
        r.has_liveness_probe = true;
        r.has_readiness_probe = true;
        r.run_as_non_root = Some(true);
        r.read_only_root_filesystem = Some(true);
        r.network_policy_attached = true;
        r
    }

    #[tokio::test]
    async fn a_fully_compliant_resource_passes_every_builtin_policy() {
        let bus = Arc::new(EventBus::new());
        let checker = ComplianceChecker::new(ComplianceConfig::default(), bus);
        let summary = checker.evaluate(&[base_resource()]).await;
        let result = &summary.results[0];
        assert!(result.checks.values().all(|c| c.passed), "{:?}", result.checks);
    }

    #[tokio::test]
    async fn latest_image_tag_fails_image_policy() {
        let bus = Arc::new(EventBus::new());
        let checker = ComplianceChecker::new(ComplianceConfig::default(), bus);
        let mut r = base_resource();
        r.image = Some("registry.example.com/web:latest".to_string());
        let summary = checker.evaluate(&[r]).await;
        assert!(!summary.results[0].checks["image-policy"].passed);
    }

    #[tokio::test]
    async fn image_allow_list_override_rejects_unlisted_registries() {
        let bus = Arc::new(EventBus::new());
        let config = ComplianceConfig {
            image_allow_list: Some(vec!["registry.internal/".to_string()]),
            ..ComplianceConfig::default()
        };
        let checker = ComplianceChecker::new(config, bus);
        let summary = checker.evaluate(&[base_resource()]).await;
        assert!(!summary.results[0].checks["image-policy"].passed);
    }

    #[tokio::test]
    async fn disabling_a_policy_excludes_it_from_results() {
        let bus = Arc::new(EventBus::new());
        let checker = ComplianceChecker::new(ComplianceConfig::default(), bus);
        checker.set_enabled("resource-ratio", false);
        let summary = checker.evaluate(&[base_resource()]).await;
        assert!(!summary.results[0].checks.contains_key("resource-ratio"));
    }

    /// Scenario S3: a `redis:latest` pod with no liveness probe and no cpu
    /// limit. Expected violations `{image-policy: high, health-checks:
    /// medium, resource-limits: high}`, averageSeverity = (3+2+3)/3 ≈ 2.67.
    #[tokio::test]
    async fn scenario_redis_latest_no_liveness_probe_no_cpu_limit() {
        let bus = Arc::new(EventBus::new());
        let checker = ComplianceChecker::new(ComplianceConfig::default(), bus);
        let mut r = Resource::new(ResourceRef::new("Pod", "default", "cache"));
        r.image = Some("redis:latest".to_string());
        r.has_liveness_probe = false;
        r.has_readiness_probe = true;
        r.cpu_request_millis = Some(100);
        r.memory_request_gib = Some(0.125);
        r.memory_limit_gib = Some(0.25);
        r.replicas = Some(2);
        r.run_as_non_root = Some(true);
        r.read_only_root_filesystem = Some(true);
        r.network_policy_attached = true;

        let summary = checker.evaluate(&[r]).await;
        let result = &summary.results[0];
        assert!(!result.checks["image-policy"].passed);
        assert!(!result.checks["health-checks"].passed);
        assert!(!result.checks["resource-limits"].passed);
        assert!(result.checks.values().filter(|c| !c.passed).count() == 3, "{:?}", result.checks);
        assert!((result.average_severity - 2.666_666_7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn high_severity_violation_publishes_critical_violations_event() {
        let bus = Arc::new(EventBus::new());
        let received = Arc::new(std::sync::Mutex::new(false));
        let received_clone = received.clone();
        bus.subscribe("compliance:criticalViolations", move |_| {
            *received_clone.lock().unwrap() = true;
        });
        let checker = ComplianceChecker::new(ComplianceConfig::default(), bus);
        let mut r = base_resource();
        r.privileged = Some(true);
        checker.evaluate(&[r]).await;
        assert!(*received.lock().unwrap());
    }
}
