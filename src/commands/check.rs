use forge_hdr::config::Config;

/// Sanity-checks a configuration without starting any background loop —
/// the abstract-cluster-client equivalent of the teacher's connectivity
/// checklist, since there is no live `kube::Client` to dial out to at this
/// layer. Delegates the actual pass/fail to `Config::validate` (the same
/// check `Supervisor::start` runs) so this checklist can never drift out of
/// sync with what would actually abort startup.
pub fn run(config: &Config) -> anyhow::Result<()> {
    println!("Checking configuration...\n");

    print!("  Metrics bind address ......... ");
    match config.metrics.bind_addr.parse::<std::net::SocketAddr>() {
        Ok(addr) => println!("OK ({addr})"),
        Err(_) => println!("FAIL"),
    }

    print!("  Budget thresholds ............ ");
    println!("{:.0}% alert / {:.0}% hard limit of {:.2}", config.budget.alert_threshold_fraction * 100.0, config.budget.hard_limit_fraction * 100.0, config.budget.monthly_limit);

    print!("  Circuit breaker backoff ...... ");
    println!("{}s -> {}s", config.circuit_breaker.base_backoff_secs, config.circuit_breaker.max_backoff_secs);

    print!("  Policy optimizer confidence ... ");
    println!("{:.0}%", config.policy_optimizer.auto_apply_confidence_threshold * 100.0);

    print!("  Periodic intervals ............ ");
    println!(
        "topology {}s / metrics {}s / policy optimizer {}s",
        config.topology.analysis_interval_secs, config.metrics.export_interval_secs, config.policy_optimizer.optimization_interval_secs
    );

    config.validate()?;

    println!("\nAll checks completed.");
    Ok(())
}
