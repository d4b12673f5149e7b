//! Performance bottleneck detection.
//!
//! Each pass compares every context's trailing window against its own
//! baseline, taken from the samples just before that window. A signal has
//! to stay past the deviation multiple for several consecutive passes before
//! it is reported, and a pass where it normalizes resets the count.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ctxwatch_types::{Bottleneck, BottleneckKind, MetricPath, MetricsSample, Severity};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::alerts::AGGREGATE_TARGET;
use crate::config::BottleneckConfig;
use crate::state::Published;

/// Ratio reported when a throughput signal drops to zero.
const MAX_RATIO: f64 = 100.0;

#[derive(Debug, Clone, Copy)]
struct Deviation {
    kind: BottleneckKind,
    ratio: f64,
    baseline: f64,
    current: f64,
}

/// Finds sustained per-context deviations from baseline.
#[derive(Debug)]
pub struct BottleneckDetector {
    config: BottleneckConfig,
    streaks: Mutex<HashMap<(String, BottleneckKind), u32>>,
    current: Published<Vec<Bottleneck>>,
}

impl BottleneckDetector {
    pub fn new(config: BottleneckConfig) -> Self {
        Self {
            config,
            streaks: Mutex::new(HashMap::new()),
            current: Published::default(),
        }
    }

    /// Samples one pass needs, newest last.
    pub fn window_len(&self) -> usize {
        self.config.trailing_window + self.config.baseline_window
    }

    /// Bottlenecks from the last pass.
    pub fn current(&self) -> Arc<Vec<Bottleneck>> {
        self.current.load()
    }

    /// Run one analysis pass over `history` (oldest first).
    ///
    /// The result replaces the previously published set.
    pub fn analyze(&self, history: &[Arc<MetricsSample>], now_ms: u64) -> Vec<Bottleneck> {
        let trailing_len = self.config.trailing_window.max(1);
        if history.len() <= trailing_len {
            debug!(samples = history.len(), "not enough history for bottleneck analysis");
            self.streaks.lock().clear();
            self.current.store(Vec::new());
            return Vec::new();
        }

        let split = history.len() - trailing_len;
        let trailing = &history[split..];
        let baseline_start = split.saturating_sub(self.config.baseline_window);
        let baseline = &history[baseline_start..split];

        let contexts: BTreeSet<&str> = trailing
            .iter()
            .flat_map(|s| s.contexts.keys().map(String::as_str))
            .collect();

        let mut deviations: Vec<(String, Deviation)> = Vec::new();
        for ctx in contexts {
            for (kind, path) in [
                (BottleneckKind::Memory, MetricPath::MemoryUsage),
                (BottleneckKind::Latency, MetricPath::ResponseTime),
                (BottleneckKind::Throughput, MetricPath::NetworkRequests),
            ] {
                let read = |s: &Arc<MetricsSample>| s.context_metric(ctx, path);
                if let Some(d) = self.deviation(kind, baseline, trailing, read) {
                    deviations.push((ctx.to_string(), d));
                }
            }
        }
        let cpu = |s: &Arc<MetricsSample>| s.aggregate.cpu_usage;
        if let Some(d) = self.deviation(BottleneckKind::Cpu, baseline, trailing, cpu) {
            deviations.push((AGGREGATE_TARGET.to_string(), d));
        }

        let mut streaks = self.streaks.lock();
        let previous = std::mem::take(&mut *streaks);
        let mut sustained: HashMap<String, (Deviation, u32)> = HashMap::new();
        for (ctx, d) in deviations {
            let key = (ctx.clone(), d.kind);
            let streak = previous.get(&key).copied().unwrap_or(0) + 1;
            streaks.insert(key, streak);
            if streak < self.config.sustained_passes.max(1) {
                continue;
            }
            let replace = sustained
                .get(&ctx)
                .map_or(true, |(best, _)| d.ratio > best.ratio);
            if replace {
                sustained.insert(ctx, (d, streak));
            }
        }
        drop(streaks);

        let window_start_ms = trailing.first().map_or(0, |s| s.timestamp_ms);
        let window_end_ms = trailing.last().map_or(0, |s| s.timestamp_ms);

        let mut found: Vec<Bottleneck> = sustained
            .into_iter()
            .map(|(context_id, (d, streak))| Bottleneck {
                context_id,
                kind: d.kind,
                severity: severity_for(d.ratio),
                estimated_slowdown_pct: (d.ratio - 1.0) * 100.0,
                baseline: d.baseline,
                current: d.current,
                sustained_passes: streak,
                window_start_ms,
                window_end_ms,
                detected_at_ms: now_ms,
            })
            .collect();
        found.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.context_id.cmp(&b.context_id))
        });

        for b in &found {
            info!(
                context = %b.context_id,
                kind = %b.kind,
                severity = %b.severity,
                slowdown_pct = b.estimated_slowdown_pct,
                "bottleneck detected"
            );
        }
        self.current.store(found.clone());
        found
    }

    fn deviation<F>(
        &self,
        kind: BottleneckKind,
        baseline: &[Arc<MetricsSample>],
        trailing: &[Arc<MetricsSample>],
        read: F,
    ) -> Option<Deviation>
    where
        F: Fn(&Arc<MetricsSample>) -> Option<f64>,
    {
        let base: Vec<f64> = baseline.iter().filter_map(&read).collect();
        let recent: Vec<f64> = trailing.iter().filter_map(&read).collect();
        if base.len() < self.config.min_baseline_samples.max(1) || recent.is_empty() {
            return None;
        }
        let base_mean = mean(&base);
        let current = mean(&recent);

        let ratio = match kind {
            // A drop in throughput is the degradation.
            BottleneckKind::Throughput => {
                if base_mean <= 0.0 {
                    return None;
                }
                if current <= 0.0 {
                    MAX_RATIO
                } else {
                    (base_mean / current).min(MAX_RATIO)
                }
            }
            _ => {
                if base_mean <= 0.0 {
                    return None;
                }
                (current / base_mean).min(MAX_RATIO)
            }
        };

        (ratio > self.config.deviation_multiple).then_some(Deviation {
            kind,
            ratio,
            baseline: base_mean,
            current,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Severity from the deviation ratio.
pub fn severity_for(ratio: f64) -> Severity {
    if ratio >= 3.0 {
        Severity::Critical
    } else if ratio >= 2.0 {
        Severity::Error
    } else if ratio >= 1.5 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxwatch_types::ContextRole;

    fn config() -> BottleneckConfig {
        BottleneckConfig {
            trailing_window: 5,
            baseline_window: 20,
            min_baseline_samples: 10,
            ..BottleneckConfig::default()
        }
    }

    fn history(baseline: usize, base_mem: f64, trailing: usize, mem: f64) -> Vec<Arc<MetricsSample>> {
        (0..baseline + trailing)
            .map(|i| {
                let m = if i < baseline { base_mem } else { mem };
                Arc::new(
                    MetricsSample::builder()
                        .sequence(i as u64 + 1)
                        .timestamp_ms((i as u64 + 1) * 1_000)
                        .context("sw", ContextRole::BackgroundWorker, |c| {
                            c.memory_usage_mb(m).response_time_ms(20.0).network_requests(4)
                        })
                        .build(),
                )
            })
            .collect()
    }

    #[test]
    fn sustained_memory_growth_is_reported() {
        let detector = BottleneckDetector::new(config());
        let samples = history(20, 100.0, 5, 150.0);

        assert!(detector.analyze(&samples, 30_000).is_empty());
        assert!(detector.analyze(&samples, 60_000).is_empty());
        let found = detector.analyze(&samples, 90_000);

        assert_eq!(found.len(), 1);
        let b = &found[0];
        assert_eq!(b.context_id, "sw");
        assert_eq!(b.kind, BottleneckKind::Memory);
        assert_eq!(b.severity, Severity::Warning);
        assert!((b.estimated_slowdown_pct - 50.0).abs() < 1e-9);
        assert_eq!(b.baseline, 100.0);
        assert_eq!(b.current, 150.0);
        assert_eq!(b.window_start_ms, 21_000);
        assert_eq!(b.window_end_ms, 25_000);
        assert_eq!(detector.current().len(), 1);
    }

    #[test]
    fn normal_pass_resets_streak() {
        let detector = BottleneckDetector::new(config());
        let degraded = history(20, 100.0, 5, 150.0);
        let normal = history(20, 100.0, 5, 100.0);

        detector.analyze(&degraded, 1);
        detector.analyze(&degraded, 2);
        detector.analyze(&normal, 3);
        assert!(detector.analyze(&degraded, 4).is_empty());
        assert!(detector.analyze(&degraded, 5).is_empty());
        assert_eq!(detector.analyze(&degraded, 6).len(), 1);

        // The published set is replaced on every pass
        assert!(detector.analyze(&normal, 7).is_empty());
        assert!(detector.current().is_empty());
    }

    #[test]
    fn short_baseline_is_ignored() {
        let detector = BottleneckDetector::new(config());
        let samples = history(5, 100.0, 5, 500.0);
        for pass in 0..5 {
            assert!(detector.analyze(&samples, pass).is_empty());
        }
    }

    #[test]
    fn throughput_drop_counts_as_degradation() {
        let detector = BottleneckDetector::new(BottleneckConfig {
            sustained_passes: 1,
            ..config()
        });
        let samples: Vec<_> = (0..25u64)
            .map(|i| {
                let requests = if i < 20 { 12 } else { 3 };
                Arc::new(
                    MetricsSample::builder()
                        .sequence(i + 1)
                        .timestamp_ms(i * 1_000)
                        .context("cs", ContextRole::PageScript, |c| c.network_requests(requests))
                        .build(),
                )
            })
            .collect();

        let found = detector.analyze(&samples, 0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, BottleneckKind::Throughput);
        assert_eq!(found[0].severity, Severity::Critical);
        assert!((found[0].estimated_slowdown_pct - 300.0).abs() < 1e-9);
    }

    #[test]
    fn severity_bands() {
        assert_eq!(severity_for(3.0), Severity::Critical);
        assert_eq!(severity_for(2.5), Severity::Error);
        assert_eq!(severity_for(1.5), Severity::Warning);
        assert_eq!(severity_for(1.31), Severity::Info);
    }
}
