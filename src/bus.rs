//! The in-process event fabric every component publishes to and subscribes
//! from. Fan-out is synchronous and preserves subscriber registration order;
//! a panicking handler is caught and logged so it never takes down the
//! publisher or starves later subscribers — no component in this crate ever
//! sees a `Result` back from `publish`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A single bus event: a topic plus a free-form JSON payload. Payload keys
/// are documented per-topic in the external interfaces section; callers
/// that need typed access should pull specific fields out with
/// `Event::field`.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
}

/// Topic-keyed pub/sub bus. One mutex guards the subscriber table; the
/// handler list is cloned out of the lock before invocation so no handler
/// ever runs while holding the bus lock, matching the "no lock spans a
/// publish" rule every other component's locking follows.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: Mutex<u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Registers `handler` on `topic`, returning a subscription id that can
    /// later be passed to `unsubscribe`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = {
            let mut next_id = self.next_id.lock().expect("bus id lock poisoned");
            let id = *next_id;
            *next_id += 1;
            id
        };
        let mut subs = self.subscribers.lock().expect("bus subscribers lock poisoned");
        subs.entry(topic.into()).or_default().push(Subscription {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Removes a subscription by id. Idempotent: calling it again, or on an
    /// id that never existed, is a no-op.
    pub fn unsubscribe(&self, topic: &str, id: u64) {
        let mut subs = self.subscribers.lock().expect("bus subscribers lock poisoned");
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|s| s.id != id);
        }
    }

    /// Publishes `event` to every subscriber of `event.topic`, in
    /// registration order. Each handler is run through `catch_unwind`; a
    /// panic is logged and swallowed, never propagated to the caller or to
    /// later handlers.
    pub fn publish(&self, event: Event) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.lock().expect("bus subscribers lock poisoned");
            subs.get(&event.topic)
                .map(|list| list.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            let event_ref = &event;
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event_ref)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(topic = %event.topic, %message, "bus_subscriber_panicked");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .expect("bus subscribers lock poisoned")
            .get(topic)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_delivers_in_registration_order() {
        let bus = EventBus::new();
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe("topic", move |_| order.lock().unwrap().push(i));
        }
        bus.publish(Event::new("topic", json!({})));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = bus.subscribe("topic", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe("topic", id);
        bus.unsubscribe("topic", id);
        bus.publish(Event::new("topic", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_panicking_handler_does_not_stop_later_handlers() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));
        bus.subscribe("topic", |_| panic!("boom"));
        let reached_clone = reached.clone();
        bus.subscribe("topic", move |_| {
            reached_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Event::new("topic", json!({})));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_with_no_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(Event::new("nobody-listening", json!({})));
        assert_eq!(bus.subscriber_count("nobody-listening"), 0);
    }
}
