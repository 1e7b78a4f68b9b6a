mod common;

use std::sync::Arc;

use forge_hdr::cluster_client::StaticClusterClient;
use forge_hdr::config::Config;
use forge_hdr::supervisor::Supervisor;

use common::make_test_resource;

#[test]
fn a_freshly_constructed_supervisor_reports_unhealthy_until_started() {
    let client = Arc::new(StaticClusterClient::new(vec![]));
    let supervisor = Arc::new(Supervisor::new(Config::default(), client));
    assert!(!supervisor.health().healthy);
    supervisor.start().expect("default config is valid");
    assert!(supervisor.health().healthy);
    supervisor.stop();
    assert!(!supervisor.health().healthy);
}

#[tokio::test]
async fn topology_analysis_through_the_supervisor_reaches_the_compliance_checker() {
    let resource = make_test_resource("web");
    let client = Arc::new(StaticClusterClient::new(vec![resource.clone()]));
    let supervisor = Arc::new(Supervisor::new(Config::default(), client));
    supervisor.start().expect("default config is valid");

    supervisor.topology.run_once().await;
    let snapshot = supervisor.topology.snapshot();
    assert_eq!(snapshot.resources.len(), 1);

    let summary = supervisor.compliance.evaluate(&snapshot.resources).await;
    assert!(summary.results[0].checks.values().all(|c| c.passed));
}

#[tokio::test]
async fn a_budget_hard_limit_breach_is_observable_on_the_bus() {
    use forge_hdr::bus::Event;
    use std::sync::atomic::{AtomicBool, Ordering};

    let client = Arc::new(StaticClusterClient::new(vec![]));
    let mut config = Config::default();
    config.budget.monthly_limit = 10.0;
    let supervisor = Arc::new(Supervisor::new(config, client));

    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = fired.clone();
    supervisor.bus.subscribe("budget:hardLimitExceeded", move |_: &Event| {
        fired_clone.store(true, Ordering::SeqCst);
    });

    let _ = supervisor.budget.admit_cost(50.0, chrono::Utc::now());
    assert!(fired.load(Ordering::SeqCst));
}
