//! Policy Optimizer (C11): every `optimizationInterval`, examines the last
//! ten entries of each tracked history and proposes recommendations when a
//! trend crosses its threshold, per spec.md §4.10. Recording is decoupled
//! from the other components: the supervisor wiring pushes a value in on
//! every bus event the optimizer cares about, rather than the optimizer
//! reaching into another component's internals.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::budget::BudgetEnforcer;
use crate::bus::{Event, EventBus};
use crate::compliance::ComplianceChecker;
use crate::config::PolicyOptimizerConfig;
use crate::model::HistoryRing;

const TREND_WINDOW: usize = 10;
const MAX_RECOMMENDATIONS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendationKind {
    ComplianceStrictness,
    BudgetIncrease,
    BudgetReduction,
    ScaleUpCpu,
    AutoRemediation,
}

impl RecommendationKind {
    pub fn label(self) -> &'static str {
        match self {
            RecommendationKind::ComplianceStrictness => "COMPLIANCE_STRICTNESS",
            RecommendationKind::BudgetIncrease => "BUDGET_INCREASE",
            RecommendationKind::BudgetReduction => "BUDGET_REDUCTION",
            RecommendationKind::ScaleUpCpu => "SCALE_UP_CPU",
            RecommendationKind::AutoRemediation => "AUTO_REMEDIATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecommendationSeverity {
    Low,
    Medium,
    High,
}

/// `currentValue`/`suggestedValue` are heterogeneous in the spec (a
/// replica-factor multiplier, a budget number, the literal string
/// `"strict"`, a boolean toggle) — carried as `serde_json::Value` rather
/// than forcing everything into `f64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub severity: RecommendationSeverity,
    pub confidence: f64,
    pub current_value: Value,
    pub suggested_value: Value,
    pub rationale: String,
    pub optimized_at: Option<DateTime<Utc>>,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComplianceTrend {
    Deteriorating,
    Improving,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CostTrend {
    Accelerating,
    Decelerating,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PerformanceTrend {
    Deteriorating,
    Improving,
    Stable,
}

fn mean(values: &[&f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().copied().sum::<f64>() / values.len() as f64
}

fn compliance_trend(values: &[&f64]) -> ComplianceTrend {
    let m = mean(values);
    if m > 5.0 {
        ComplianceTrend::Deteriorating
    } else if m < 2.0 {
        ComplianceTrend::Improving
    } else {
        ComplianceTrend::Stable
    }
}

fn cost_trend(values: &[&f64]) -> CostTrend {
    let m = mean(values);
    if m > 80.0 {
        CostTrend::Accelerating
    } else if m < 50.0 {
        CostTrend::Decelerating
    } else {
        CostTrend::Stable
    }
}

/// Threshold mirrors the `2.5`s histogram bucket boundary the performance
/// profiler already uses, so "deteriorating" here lines up with the bucket
/// an operator would see filling up on the exported histogram.
fn performance_trend(values: &[&f64]) -> PerformanceTrend {
    let m = mean(values);
    if m > 2.5 {
        PerformanceTrend::Deteriorating
    } else if m < 0.5 {
        PerformanceTrend::Improving
    } else {
        PerformanceTrend::Stable
    }
}

/// Owns the three trend histories (compliance violation counts, budget
/// percentage-used, cpu usage percentage) and the capped, newest-first
/// recommendation list.
pub struct PolicyOptimizer {
    config: PolicyOptimizerConfig,
    bus: Arc<EventBus>,
    compliance_violation_counts: Mutex<HistoryRing<f64>>,
    budget_percent_used: Mutex<HistoryRing<f64>>,
    cpu_usage_percent: Mutex<HistoryRing<f64>>,
    latency_p95_seconds: Mutex<HistoryRing<f64>>,
    recommendations: Mutex<VecDeque<Recommendation>>,
}

impl PolicyOptimizer {
    pub fn new(config: PolicyOptimizerConfig, bus: Arc<EventBus>) -> Self {
        Self {
            compliance_violation_counts: Mutex::new(HistoryRing::new(TREND_WINDOW)),
            budget_percent_used: Mutex::new(HistoryRing::new(TREND_WINDOW)),
            cpu_usage_percent: Mutex::new(HistoryRing::new(TREND_WINDOW)),
            latency_p95_seconds: Mutex::new(HistoryRing::new(TREND_WINDOW)),
            recommendations: Mutex::new(VecDeque::new()),
            config,
            bus,
        }
    }

    pub fn record_compliance_violation_count(&self, count: f64) {
        self.compliance_violation_counts.lock().expect("optimizer lock poisoned").push(count);
    }

    pub fn record_budget_percent_used(&self, percent: f64) {
        self.budget_percent_used.lock().expect("optimizer lock poisoned").push(percent);
    }

    pub fn record_cpu_usage_percent(&self, percent: f64) {
        self.cpu_usage_percent.lock().expect("optimizer lock poisoned").push(percent);
    }

    pub fn record_latency_p95(&self, seconds: f64) {
        self.latency_p95_seconds.lock().expect("optimizer lock poisoned").push(seconds);
    }

    fn confidence_for(sample_count: usize) -> f64 {
        (sample_count as f64 / TREND_WINDOW as f64).min(1.0)
    }

    /// Re-evaluates every tracked history and appends any newly warranted
    /// recommendation to the capped, newest-first list. A component whose
    /// history doesn't yet show a clear trend contributes nothing this
    /// round.
    pub fn analyze(&self) -> Vec<Recommendation> {
        let mut produced = Vec::new();

        {
            let history = self.compliance_violation_counts.lock().expect("optimizer lock poisoned");
            let window = history.last_n(TREND_WINDOW);
            if !window.is_empty() && compliance_trend(&window) == ComplianceTrend::Deteriorating {
                let mean_violations = mean(&window);
                produced.push(Recommendation {
                    kind: RecommendationKind::ComplianceStrictness,
                    severity: RecommendationSeverity::High,
                    confidence: Self::confidence_for(window.len()),
                    current_value: json!("standard"),
                    suggested_value: json!("strict"),
                    rationale: format!(
                        "mean violation count over the last {} checks is {mean_violations:.1}, above the deteriorating threshold of 5",
                        window.len()
                    ),
                    optimized_at: None,
                    applied: false,
                });
            }
        }

        {
            let history = self.budget_percent_used.lock().expect("optimizer lock poisoned");
            let window = history.last_n(TREND_WINDOW);
            if !window.is_empty() {
                let mean_percent = mean(&window);
                match cost_trend(&window) {
                    CostTrend::Accelerating => produced.push(Recommendation {
                        kind: RecommendationKind::BudgetIncrease,
                        severity: RecommendationSeverity::Medium,
                        confidence: Self::confidence_for(window.len()),
                        current_value: json!(1.0),
                        suggested_value: json!(1.2),
                        rationale: format!(
                            "mean budget utilization over the last {} windows is {mean_percent:.1}%, above the accelerating threshold of 80%",
                            window.len()
                        ),
                        optimized_at: None,
                        applied: false,
                    }),
                    CostTrend::Decelerating => produced.push(Recommendation {
                        kind: RecommendationKind::BudgetReduction,
                        severity: RecommendationSeverity::Low,
                        confidence: Self::confidence_for(window.len()),
                        current_value: json!(1.0),
                        suggested_value: json!(0.9),
                        rationale: format!(
                            "mean budget utilization over the last {} windows is {mean_percent:.1}%, below the decelerating threshold of 50%",
                            window.len()
                        ),
                        optimized_at: None,
                        applied: false,
                    }),
                    CostTrend::Stable => {}
                }
            }
        }

        {
            let history = self.cpu_usage_percent.lock().expect("optimizer lock poisoned");
            let window = history.last_n(TREND_WINDOW);
            if let Some(&&last) = window.last() {
                if last > 80.0 {
                    produced.push(Recommendation {
                        kind: RecommendationKind::ScaleUpCpu,
                        severity: RecommendationSeverity::High,
                        confidence: Self::confidence_for(window.len()),
                        current_value: json!(1.0),
                        suggested_value: json!(1.5),
                        rationale: format!("most recent cpu usage sample is {last:.1}%, above the 80% saturation threshold"),
                        optimized_at: None,
                        applied: false,
                    });
                }
            }
        }

        {
            let history = self.latency_p95_seconds.lock().expect("optimizer lock poisoned");
            let window = history.last_n(TREND_WINDOW);
            if !window.is_empty() && performance_trend(&window) == PerformanceTrend::Deteriorating {
                let mean_latency = mean(&window);
                produced.push(Recommendation {
                    kind: RecommendationKind::AutoRemediation,
                    severity: RecommendationSeverity::High,
                    confidence: Self::confidence_for(window.len()),
                    current_value: json!(false),
                    suggested_value: json!(true),
                    rationale: format!(
                        "mean p95 latency over the last {} samples is {mean_latency:.2}s, above the deteriorating threshold of 2.5s",
                        window.len()
                    ),
                    optimized_at: None,
                    applied: false,
                });
            }
        }

        let mut recommendations = self.recommendations.lock().expect("optimizer lock poisoned");
        for mut rec in produced.clone() {
            rec.optimized_at = Some(Utc::now());
            recommendations.push_front(rec);
            while recommendations.len() > MAX_RECOMMENDATIONS {
                recommendations.pop_back();
            }
        }

        produced
    }

    /// Whether an auto-apply is permitted for `confidence`, gated on both
    /// `supervisor.autoApply` and the optimizer's own confidence threshold.
    pub fn should_auto_apply(&self, auto_apply_enabled: bool, confidence: f64) -> bool {
        auto_apply_enabled && confidence >= self.config.auto_apply_confidence_threshold
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.recommendations.lock().expect("optimizer lock poisoned").iter().cloned().collect()
    }

    /// Mutates live policy/budget state per the recommendation at `index`
    /// (0 = newest), and stamps its `appliedAt`/`applied` fields. Returns an
    /// error (never touching state) if the index is out of range or the
    /// recommendation has already been applied.
    pub fn apply_recommendation(
        &self,
        index: usize,
        compliance: &ComplianceChecker,
        budget: &BudgetEnforcer,
    ) -> Result<(), String> {
        let mut recommendations = self.recommendations.lock().expect("optimizer lock poisoned");
        let Some(rec) = recommendations.get_mut(index) else {
            return Err(format!("no recommendation at index {index}"));
        };
        if rec.applied {
            return Err("recommendation already applied".to_string());
        }

        match rec.kind {
            RecommendationKind::ComplianceStrictness => {
                for name in compliance.policy_names() {
                    compliance.set_enabled(&name, true);
                }
            }
            RecommendationKind::BudgetIncrease => budget.adjust_monthly_limit(1.2),
            RecommendationKind::BudgetReduction => budget.adjust_monthly_limit(0.9),
            RecommendationKind::ScaleUpCpu | RecommendationKind::AutoRemediation => {
                // No live structure in this crate's scope to mutate for
                // these two; dispatch is the orchestration engine's job.
                // Applying still stamps the recommendation as handled so it
                // isn't re-offered.
            }
        }

        rec.applied = true;
        rec.optimized_at = Some(Utc::now());
        self.bus.publish(Event::new(
            "policyOptimizer:recommendationApplied",
            json!({ "type": rec.kind.label(), "newValue": rec.suggested_value.clone() }),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, ComplianceConfig};

    fn optimizer() -> PolicyOptimizer {
        PolicyOptimizer::new(PolicyOptimizerConfig::default(), Arc::new(EventBus::new()))
    }

    /// Scenario S6: ten compliance reports with violationCount=8 produce a
    /// COMPLIANCE_STRICTNESS recommendation with confidence >= 0.75.
    #[test]
    fn scenario_ten_reports_at_violation_count_eight_recommend_strictness() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_compliance_violation_count(8.0);
        }
        let produced = opt.analyze();
        let rec = produced
            .iter()
            .find(|r| matches!(r.kind, RecommendationKind::ComplianceStrictness))
            .expect("expected a COMPLIANCE_STRICTNESS recommendation");
        assert_eq!(rec.suggested_value, json!("strict"));
        assert!(rec.confidence >= 0.75, "confidence was {}", rec.confidence);
    }

    #[test]
    fn a_stable_violation_count_produces_no_recommendation() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_compliance_violation_count(3.0);
        }
        assert!(opt.analyze().is_empty());
    }

    #[test]
    fn an_improving_violation_count_produces_no_strictness_recommendation() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_compliance_violation_count(1.0);
        }
        assert!(opt.analyze().iter().all(|r| !matches!(r.kind, RecommendationKind::ComplianceStrictness)));
    }

    #[test]
    fn accelerating_budget_spend_recommends_an_increase() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_budget_percent_used(90.0);
        }
        let produced = opt.analyze();
        assert!(produced.iter().any(|r| matches!(r.kind, RecommendationKind::BudgetIncrease)));
    }

    #[test]
    fn decelerating_budget_spend_recommends_a_reduction() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_budget_percent_used(20.0);
        }
        let produced = opt.analyze();
        assert!(produced.iter().any(|r| matches!(r.kind, RecommendationKind::BudgetReduction)));
    }

    #[test]
    fn high_cpu_usage_recommends_scale_up() {
        let opt = optimizer();
        opt.record_cpu_usage_percent(91.0);
        let produced = opt.analyze();
        assert!(produced.iter().any(|r| matches!(r.kind, RecommendationKind::ScaleUpCpu)));
    }

    #[test]
    fn sustained_high_latency_recommends_auto_remediation() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_latency_p95(3.0);
        }
        let produced = opt.analyze();
        let rec = produced
            .iter()
            .find(|r| matches!(r.kind, RecommendationKind::AutoRemediation))
            .expect("expected an AUTO_REMEDIATION recommendation");
        assert_eq!(rec.suggested_value, json!(true));
    }

    #[test]
    fn stable_latency_produces_no_auto_remediation_recommendation() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_latency_p95(1.0);
        }
        assert!(opt.analyze().iter().all(|r| !matches!(r.kind, RecommendationKind::AutoRemediation)));
    }

    #[test]
    fn recommendation_list_is_capped_and_newest_first() {
        let opt = optimizer();
        for _ in 0..30 {
            for _ in 0..10 {
                opt.record_compliance_violation_count(8.0);
            }
            opt.analyze();
        }
        let recs = opt.recommendations();
        assert!(recs.len() <= 20);
    }

    #[test]
    fn auto_apply_is_gated_on_both_flag_and_confidence() {
        let opt = optimizer();
        assert!(!opt.should_auto_apply(false, 0.99));
        assert!(!opt.should_auto_apply(true, 0.5));
        assert!(opt.should_auto_apply(true, 0.76));
    }

    #[test]
    fn applying_a_compliance_strictness_recommendation_enables_every_policy() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_compliance_violation_count(8.0);
        }
        opt.analyze();

        let bus = Arc::new(EventBus::new());
        let compliance = ComplianceChecker::new(ComplianceConfig::default(), bus.clone());
        compliance.set_enabled("resource-ratio", false);
        let budget = BudgetEnforcer::new(BudgetConfig::default(), bus);

        opt.apply_recommendation(0, &compliance, &budget).unwrap();
        assert!(opt.recommendations()[0].applied);
    }

    #[test]
    fn applying_an_already_applied_recommendation_fails() {
        let opt = optimizer();
        for _ in 0..10 {
            opt.record_budget_percent_used(90.0);
        }
        opt.analyze();

        let bus = Arc::new(EventBus::new());
        let compliance = ComplianceChecker::new(ComplianceConfig::default(), bus.clone());
        let budget = BudgetEnforcer::new(BudgetConfig::default(), bus);

        opt.apply_recommendation(0, &compliance, &budget).unwrap();
        assert!(opt.apply_recommendation(0, &compliance, &budget).is_err());
    }
}
