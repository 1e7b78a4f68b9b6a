//! Circuit Breaker Registry (C7): a closed/half-open/open state machine per
//! target, with exponential backoff on the probe schedule. Used by the
//! orchestration engine to guard every healing action dispatch.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
        }
    }
}

/// One mutex over the whole target map. `allow` may transition a breaker
/// from `Open` to `HalfOpen` as a side effect of its backoff deadline
/// elapsing — that transition and the caller's subsequent
/// `on_success`/`on_failure` are expected to happen in close succession
/// under the same lock-free window, matching how the orchestration engine
/// calls this registry.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    /// Whether a call against `target` is currently allowed. A closed or
    /// half-open breaker allows calls; an open breaker allows calls only
    /// once its backoff window has elapsed, at which point it flips to
    /// half-open as part of this check.
    pub fn allow(&self, target: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let breaker = breakers.entry(target.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => true,
            // Only the call that flips Open -> HalfOpen is admitted as the
            // probe; further calls while the probe is outstanding must wait
            // for on_success/on_failure to resolve it.
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                if breaker.next_probe_at.map(|t| Instant::now() >= t).unwrap_or(false) {
                    breaker.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self, target: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let breaker = breakers.entry(target.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => {
                breaker.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Closed;
                breaker.consecutive_failures = 0;
                breaker.opened_at = None;
                breaker.next_probe_at = None;
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self, target: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let breaker = breakers.entry(target.to_string()).or_insert_with(Breaker::new);
        breaker.consecutive_failures += 1;

        let should_open = match breaker.state {
            BreakerState::Closed => breaker.consecutive_failures >= self.config.failure_threshold,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };

        if should_open {
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(Instant::now());
            let exponent = breaker.consecutive_failures.saturating_sub(self.config.failure_threshold);
            let backoff = self
                .config
                .base_backoff_secs
                .saturating_mul(1u64.checked_shl(exponent.min(32)).unwrap_or(u64::MAX))
                .min(self.config.max_backoff_secs);
            breaker.next_probe_at = Some(Instant::now() + Duration::from_secs(backoff.max(1)));
        }
    }

    pub fn state(&self, target: &str) -> BreakerState {
        self.breakers
            .lock()
            .expect("breaker lock poisoned")
            .get(target)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Count of targets currently `Open`, for the `circuit_breaker_open_count`
    /// gauge.
    pub fn open_count(&self) -> usize {
        self.breakers
            .lock()
            .expect("breaker lock poisoned")
            .values()
            .filter(|b| b.state == BreakerState::Open)
            .count()
    }
}
