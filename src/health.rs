//! Failure-counter health monitoring: three consecutive failures for the
//! same agent/pod key emit exactly one `replacement_required` event
//! carrying the post-increment failure count. A success resets the
//! counter to zero.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::bus::{Event, EventBus};

const REPLACEMENT_THRESHOLD: u32 = 3;

pub struct HealthMonitor {
    bus: Arc<EventBus>,
    failure_counts: Mutex<HashMap<String, u32>>,
}

impl HealthMonitor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, failure_counts: Mutex::new(HashMap::new()) }
    }

    /// Records a failed health check for `key`. Returns the post-increment
    /// failure count. Emits `replacement_required` exactly once, the first
    /// time the count reaches the threshold — later failures past the
    /// threshold keep incrementing but do not re-fire the event (the caller
    /// is expected to call `mark_replaced` once it acts).
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut counts = self.failure_counts.lock().expect("health lock poisoned");
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        let post_increment = *count;

        if post_increment == REPLACEMENT_THRESHOLD {
            self.bus.publish(Event::new(
                "replacement_required",
                json!({ "key": key, "failureCount": post_increment }),
            ));
        }

        post_increment
    }

    pub fn record_success(&self, key: &str) {
        self.failure_counts.lock().expect("health lock poisoned").insert(key.to_string(), 0);
    }

    pub fn mark_replaced(&self, key: &str) {
        self.failure_counts.lock().expect("health lock poisoned").insert(key.to_string(), 0);
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.failure_counts.lock().expect("health lock poisoned").get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn third_consecutive_failure_fires_replacement_required_with_count_three() {
        let bus = Arc::new(EventBus::new());
        let captured = Arc::new(AtomicU32::new(0));
        let captured_clone = captured.clone();
        bus.subscribe("replacement_required", move |e| {
            captured_clone.store(e.field("failureCount").and_then(|v| v.as_u64()).unwrap() as u32, Ordering::SeqCst);
        });
        let monitor = HealthMonitor::new(bus);
        monitor.record_failure("agent-1");
        monitor.record_failure("agent-1");
        assert_eq!(captured.load(Ordering::SeqCst), 0, "must not fire before the third failure");
        monitor.record_failure("agent-1");
        assert_eq!(captured.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn a_success_resets_the_failure_count() {
        let bus = Arc::new(EventBus::new());
        let monitor = HealthMonitor::new(bus);
        monitor.record_failure("agent-1");
        monitor.record_failure("agent-1");
        monitor.record_success("agent-1");
        assert_eq!(monitor.failure_count("agent-1"), 0);
    }

    #[test]
    fn event_fires_exactly_once_even_past_the_threshold() {
        let bus = Arc::new(EventBus::new());
        let fire_count = Arc::new(AtomicU32::new(0));
        let fire_count_clone = fire_count.clone();
        bus.subscribe("replacement_required", move |_| {
            fire_count_clone.fetch_add(1, Ordering::SeqCst);
        });
        let monitor = HealthMonitor::new(bus);
        for _ in 0..6 {
            monitor.record_failure("agent-1");
        }
        assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keys_are_tracked_independently() {
        let bus = Arc::new(EventBus::new());
        let monitor = HealthMonitor::new(bus);
        monitor.record_failure("a");
        monitor.record_failure("b");
        assert_eq!(monitor.failure_count("a"), 1);
        assert_eq!(monitor.failure_count("b"), 1);
    }
}
