//! Performance Profiler (C9): a fixed-bucket latency histogram plus a
//! bounded observation ring used to compute percentiles by interpolation on
//! demand, never per-sample.

use std::sync::{Arc, Mutex};

use crate::bus::EventBus;
use crate::model::HistoryRing;

/// Bucket upper bounds in seconds, matching the Prometheus histogram
/// boundaries used elsewhere in this crate's metrics surface.
pub const BUCKET_BOUNDS: [f64; 7] = [0.1, 0.5, 1.0, 2.5, 5.0, 10.0, f64::INFINITY];

struct Inner {
    bucket_counts: [u64; BUCKET_BOUNDS.len()],
    total_count: u64,
    sum: f64,
    observations: HistoryRing<f64>,
}

pub struct PerformanceProfiler {
    inner: Mutex<Inner>,
}

impl Default for PerformanceProfiler {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl PerformanceProfiler {
    pub fn new(observation_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bucket_counts: [0; BUCKET_BOUNDS.len()],
                total_count: 0,
                sum: 0.0,
                observations: HistoryRing::new(observation_capacity),
            }),
        }
    }

    pub fn record(&self, seconds: f64) {
        let mut inner = self.inner.lock().expect("profiler lock poisoned");
        for (i, bound) in BUCKET_BOUNDS.iter().enumerate() {
            if seconds <= *bound {
                inner.bucket_counts[i] += 1;
            }
        }
        inner.total_count += 1;
        inner.sum += seconds;
        inner.observations.push(seconds);
    }

    pub fn total_count(&self) -> u64 {
        self.inner.lock().expect("profiler lock poisoned").total_count
    }

    pub fn sum(&self) -> f64 {
        self.inner.lock().expect("profiler lock poisoned").sum
    }

    pub fn bucket_counts(&self) -> [u64; BUCKET_BOUNDS.len()] {
        self.inner.lock().expect("profiler lock poisoned").bucket_counts
    }

    /// Percentile by linear interpolation between the two bracketing sorted
    /// observations, computed fresh from the observation ring each call.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let inner = self.inner.lock().expect("profiler lock poisoned");
        let mut sorted: Vec<f64> = inner.observations.iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        if sorted.len() == 1 {
            return Some(sorted[0]);
        }
        let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return Some(sorted[lower]);
        }
        let fraction = rank - lower as f64;
        Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
    }

    /// Subscribes to `request:completed {id, status, duration, error?}` and
    /// records `duration` (milliseconds on the wire) in seconds.
    pub fn install_on_bus(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let this = self.clone();
        bus.subscribe("request:completed", move |e| {
            if let Some(duration_ms) = e.field("duration").and_then(|v| v.as_f64()) {
                this.record(duration_ms / 1000.0);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_increments_every_bucket_at_or_above_the_value() {
        let profiler = PerformanceProfiler::new(100);
        profiler.record(0.3);
        let counts = profiler.bucket_counts();
        assert_eq!(counts[0], 0, "0.3s should not land in the 0.1s bucket");
        assert_eq!(counts[1], 1, "0.3s should land in the 0.5s bucket");
        assert_eq!(counts[6], 1, "every observation lands in the +Inf bucket");
    }

    #[test]
    fn percentile_on_uniform_series_matches_expected_rank() {
        let profiler = PerformanceProfiler::new(100);
        for i in 1..=100 {
            profiler.record(i as f64);
        }
        let p50 = profiler.percentile(0.5).unwrap();
        assert!((p50 - 50.5).abs() < 1.0, "p50 was {p50}");
    }

    #[test]
    fn percentile_on_empty_profiler_is_none() {
        let profiler = PerformanceProfiler::new(100);
        assert_eq!(profiler.percentile(0.99), None);
    }

    #[test]
    fn observation_ring_bounds_memory_but_bucket_counts_stay_cumulative() {
        let profiler = PerformanceProfiler::new(5);
        for _ in 0..50 {
            profiler.record(1.0);
        }
        assert_eq!(profiler.total_count(), 50);
        assert_eq!(profiler.percentile(0.5), Some(1.0));
    }
}
