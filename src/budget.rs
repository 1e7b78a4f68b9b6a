//! Budget Enforcer (C5): tracks spend against monthly/daily limits,
//! resetting idempotently on date rollover and emitting threshold events
//! exactly once per crossing.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::{Event, EventBus};
use crate::config::BudgetConfig;
use crate::error::BudgetError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub daily_spent: f64,
    pub monthly_spent: f64,
    pub daily_limit: f64,
    pub monthly_limit: f64,
    pub alert_active: bool,
    pub hard_limit_exceeded: bool,
    pub total_incurred: f64,
}

struct Ledger {
    day: NaiveDate,
    month: (i32, u32),
    daily_spent: f64,
    monthly_spent: f64,
    alert_armed: bool,
    /// Never reset, unlike `monthly_spent` — backs the `costs_incurred`
    /// Prometheus counter, which must only ever climb.
    total_incurred: f64,
    /// Set by `adjust_monthly_limit`; when present, supersedes
    /// `config.monthly_limit` for alert/hard-limit comparisons.
    monthly_limit_override: Option<f64>,
}

impl Ledger {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            month: (now.date_naive().year(), now.date_naive().month()),
            daily_spent: 0.0,
            monthly_spent: 0.0,
            alert_armed: true,
            total_incurred: 0.0,
            monthly_limit_override: None,
        }
    }
}

/// Owns the ledger behind a single mutex. Resets are idempotent: calling
/// `admit_cost` many times on the same day/month only ever resets once per
/// rollover, because the reset check happens before the cost is applied and
/// mutates `day`/`month` as part of the same critical section.
pub struct BudgetEnforcer {
    config: BudgetConfig,
    bus: Arc<EventBus>,
    ledger: Mutex<Ledger>,
}

impl BudgetEnforcer {
    pub fn new(config: BudgetConfig, bus: Arc<EventBus>) -> Self {
        Self {
            ledger: Mutex::new(Ledger::new(Utc::now())),
            config,
            bus,
        }
    }

    /// Applies a cost event at time `now`. Returns `Err(BudgetError::Denied)`
    /// once the hard (monthly) limit has been exceeded; the cost is still
    /// recorded so the caller can observe exactly how far over the limit
    /// spend has gone.
    pub fn admit_cost(&self, amount: f64, now: DateTime<Utc>) -> Result<(), BudgetError> {
        let mut ledger = self.ledger.lock().expect("budget lock poisoned");

        let today = now.date_naive();
        if today != ledger.day {
            ledger.daily_spent = 0.0;
            ledger.day = today;
        }
        let month = (today.year(), today.month());
        if month != ledger.month {
            ledger.monthly_spent = 0.0;
            ledger.month = month;
            ledger.alert_armed = true;
        }

        ledger.daily_spent += amount;
        ledger.monthly_spent += amount;
        ledger.total_incurred += amount;

        let effective_monthly_limit = ledger.monthly_limit_override.unwrap_or(self.config.monthly_limit);

        let alert_threshold = effective_monthly_limit * self.config.alert_threshold_fraction;
        if ledger.monthly_spent >= alert_threshold && ledger.alert_armed {
            ledger.alert_armed = false;
            let percent_used = 100.0 * ledger.monthly_spent / effective_monthly_limit;
            self.bus.publish(Event::new("budget:alertThresholdExceeded", json!({ "percentUsed": percent_used })));
        }

        let hard_limit = effective_monthly_limit * self.config.hard_limit_fraction;
        if ledger.monthly_spent >= hard_limit {
            self.bus.publish(Event::new(
                "budget:hardLimitExceeded",
                json!({ "monthlySpent": ledger.monthly_spent, "limit": hard_limit }),
            ));
            return Err(BudgetError::Denied {
                spent: ledger.monthly_spent,
                limit: hard_limit,
            });
        }

        Ok(())
    }

    pub fn status(&self) -> BudgetStatus {
        let ledger = self.ledger.lock().expect("budget lock poisoned");
        let effective_monthly_limit = ledger.monthly_limit_override.unwrap_or(self.config.monthly_limit);
        BudgetStatus {
            daily_spent: ledger.daily_spent,
            monthly_spent: ledger.monthly_spent,
            daily_limit: self.config.daily_limit,
            monthly_limit: effective_monthly_limit,
            alert_active: !ledger.alert_armed,
            hard_limit_exceeded: ledger.monthly_spent >= effective_monthly_limit * self.config.hard_limit_fraction,
            total_incurred: ledger.total_incurred,
        }
    }

    /// Scales the effective monthly limit by `factor`, applied by the
    /// policy optimizer's BUDGET_INCREASE/BUDGET_REDUCTION recommendations.
    /// Daily limit is left alone; only the monthly ceiling is adaptive.
    pub fn adjust_monthly_limit(&self, factor: f64) {
        let mut ledger = self.ledger.lock().expect("budget lock poisoned");
        ledger.monthly_limit_override = Some(ledger.monthly_limit_override.unwrap_or(self.config.monthly_limit) * factor);
    }

    /// Subscribes to `cost:incurred {operation, cost}` so the enforcer
    /// tracks spend published by any producer, not just direct callers.
    /// Malformed payloads (missing/non-numeric `cost`) are ignored.
    pub fn install_on_bus(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.subscribe("cost:incurred", move |e| {
            if let Some(cost) = e.field("cost").and_then(|v| v.as_f64()) {
                let _ = this.admit_cost(cost, Utc::now());
            }
        });
    }
}
