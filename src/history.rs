//! Bounded history of published samples.
//!
//! Feeds trend and pattern rules, the bottleneck detector, health sparklines
//! and `export_metrics_history`.

use std::collections::VecDeque;
use std::sync::Arc;

use ctxwatch_types::{MetricPath, MetricsSample};

/// Tracks recent samples, oldest first.
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: VecDeque<Arc<MetricsSample>>,
    capacity: usize,
}

impl SampleHistory {
    /// Create an empty history holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Record a new sample, evicting the oldest when full.
    pub fn record(&mut self, sample: Arc<MetricsSample>) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Arc<MetricsSample>> {
        self.samples.back()
    }

    /// The most recent `n` samples, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<Arc<MetricsSample>> {
        let start = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(start).cloned().collect()
    }

    /// Values of one metric for one context over the last `n` samples.
    ///
    /// Samples where the context or signal is missing are skipped.
    pub fn series(&self, context_id: &str, path: MetricPath, n: usize) -> Vec<f64> {
        let start = self.samples.len().saturating_sub(n);
        self.samples
            .iter()
            .skip(start)
            .filter_map(|s| s.context_metric(context_id, path))
            .collect()
    }

    /// Health sparkline for a context (normalized to 0-7 for 8 bar levels).
    ///
    /// Returns an empty Vec if there's not enough history.
    pub fn health_sparkline(&self, context_id: &str, n: usize) -> Vec<u8> {
        let values = self.series(context_id, MetricPath::HealthScore, n);
        if values.len() < 2 {
            return Vec::new();
        }
        values
            .iter()
            .map(|v| {
                let normalized = (v.clamp(0.0, 1.0) * 7.0).round() as u8;
                normalized.min(7)
            })
            .collect()
    }

    /// Serialize the last `limit` samples as a JSON array.
    pub fn to_json(&self, limit: usize) -> serde_json::Result<String> {
        let samples: Vec<&MetricsSample> = self
            .samples
            .iter()
            .skip(self.samples.len().saturating_sub(limit))
            .map(|s| s.as_ref())
            .collect();
        serde_json::to_string(&samples)
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new(900)
    }
}
