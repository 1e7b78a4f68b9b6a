//! Anomaly Detector (C8): a rolling mean/stddev baseline per metric,
//! updated incrementally (Welford's algorithm) so the ring never needs a
//! full rescan on each sample. Detection uses a z-score style threshold:
//! `k = threshold * 10` standard deviations from the mean.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::bus::{Event, EventBus};
use crate::config::AnomalyConfig;

struct Baseline {
    samples: VecDeque<f64>,
    window: usize,
    mean: f64,
    m2: f64,
}

impl Baseline {
    fn new(window: usize) -> Self {
        Self { samples: VecDeque::with_capacity(window), window, mean: 0.0, m2: 0.0 }
    }

    /// Welford's online update for mean/variance, with the ring's oldest
    /// sample removed first if the window is already full (so `m2`/`mean`
    /// always reflect exactly the samples still in `samples`).
    fn push(&mut self, value: f64) {
        if self.samples.len() >= self.window {
            if let Some(removed) = self.samples.pop_front() {
                let n = self.samples.len() as f64;
                if n > 0.0 {
                    let new_mean = self.mean + (self.mean - removed) / n;
                    self.m2 -= (removed - self.mean) * (removed - new_mean);
                    self.mean = new_mean;
                } else {
                    self.mean = 0.0;
                    self.m2 = 0.0;
                }
            }
        }
        self.samples.push_back(value);
        let n = self.samples.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn stddev(&self) -> f64 {
        let n = self.samples.len() as f64;
        if n < 2.0 {
            0.0
        } else {
            (self.m2 / n).sqrt()
        }
    }
}

pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub mean: f64,
    pub stddev: f64,
    pub z_score: f64,
}

/// One mutex across every metric's baseline. Cold-start: a metric needs at
/// least `window/2` samples before detection activates — before that,
/// `observe` always reports "not yet an anomaly" so a sparse series doesn't
/// immediately trip on its second data point.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    bus: Arc<EventBus>,
    baselines: Mutex<HashMap<String, Baseline>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, bus: Arc<EventBus>) -> Self {
        Self { config, bus, baselines: Mutex::new(HashMap::new()) }
    }

    /// Observes `value` for `metric`, updates its baseline, and publishes
    /// `anomaly:detected {type, value, threshold}` when the sample is flagged.
    /// `metric` doubles as the opaque anomaly `type` carried on the event
    /// (e.g. `HIGH_ERROR_RATE`, `LATENCY_SPIKE`).
    pub fn observe(&self, metric: &str, value: f64) -> AnomalyResult {
        let mut baselines = self.baselines.lock().expect("anomaly lock poisoned");
        let baseline = baselines
            .entry(metric.to_string())
            .or_insert_with(|| Baseline::new(self.config.window_size));

        let cold_start = baseline.samples.len() < self.config.window_size / 2;
        let mean_before = baseline.mean;
        let stddev_before = baseline.stddev();

        baseline.push(value);
        drop(baselines);

        if cold_start {
            return AnomalyResult { is_anomaly: false, mean: mean_before, stddev: stddev_before, z_score: 0.0 };
        }

        let k = self.config.threshold * 10.0;
        // A perfectly flat baseline (stddev 0) has no scale to divide by;
        // any departure from it is unboundedly many standard deviations
        // out, so treat it as an immediate anomaly rather than suppressing
        // detection entirely.
        let (z_score, is_anomaly) = if stddev_before == 0.0 {
            if value == mean_before { (0.0, false) } else { (f64::INFINITY, true) }
        } else {
            let z = (value - mean_before).abs() / stddev_before;
            (z, z > k)
        };
        if is_anomaly {
            self.bus.publish(Event::new(
                "anomaly:detected",
                json!({ "type": metric, "value": value, "threshold": k }),
            ));
        }
        AnomalyResult { is_anomaly, mean: mean_before, stddev: stddev_before, z_score }
    }
}
