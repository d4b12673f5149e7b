//! MetricsSample - one sampling cycle across all tracked contexts.

use std::collections::BTreeMap;

use crate::{ContextRole, MetricPath, MetricScope, SCHEMA_VERSION};

/// Outcome of the probe that produced a context's metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ProbeStatus {
    #[default]
    Success,
    /// Some signals were read, others are missing.
    Partial,
    /// Nothing could be read; the context is temporarily unknown.
    Failure,
}

/// Metrics for one context within a sample.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextMetrics {
    pub role: ContextRole,

    /// Heap in use, in megabytes. `None` when the context didn't report it.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub memory_usage_mb: Option<f64>,

    /// Round trip of the metrics probe.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub response_time_ms: Option<f64>,

    /// Console errors observed since the previous sample.
    pub error_count: u64,

    /// Network requests completed since the previous sample.
    pub network_requests: u64,

    /// Human-readable problems found while probing, oldest first.
    pub issues: Vec<String>,

    /// Composite health in `[0, 1]`.
    pub health_score: f64,

    pub is_healthy: bool,

    pub probe_status: ProbeStatus,
}

impl ContextMetrics {
    /// Create a builder for context metrics.
    pub fn builder(role: ContextRole) -> ContextMetricsBuilder {
        ContextMetricsBuilder::new(role)
    }

    /// Metrics for a context whose probe failed outright.
    pub fn failed(role: ContextRole, issue: impl Into<String>) -> Self {
        Self {
            role,
            memory_usage_mb: None,
            response_time_ms: None,
            error_count: 0,
            network_requests: 0,
            issues: vec![issue.into()],
            health_score: 0.0,
            is_healthy: false,
            probe_status: ProbeStatus::Failure,
        }
    }

    /// Resolve a context-scoped metric path.
    ///
    /// Returns `None` for paths of another scope or for signals that
    /// weren't reported this cycle.
    pub fn metric(&self, path: MetricPath) -> Option<f64> {
        match path {
            MetricPath::MemoryUsage => self.memory_usage_mb,
            MetricPath::ResponseTime => self.response_time_ms,
            MetricPath::ErrorCount => Some(self.error_count as f64),
            MetricPath::HealthScore => Some(self.health_score),
            MetricPath::NetworkRequests => Some(self.network_requests as f64),
            _ => None,
        }
    }
}

/// Sample-wide metrics that don't belong to a single context.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AggregateMetrics {
    /// Process CPU usage in percent. Only set when a real source provides it.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub cpu_usage: Option<f64>,

    /// Mean network request duration across all contexts.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub network_latency_ms: Option<f64>,
}

/// A point-in-time sample of every tracked context.
///
/// Produced once per sampling cycle and shared read-only (behind `Arc`) with
/// every downstream consumer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSample {
    /// Schema version for exported history.
    pub version: u32,

    /// Cycle number, strictly increasing within a session.
    pub sequence: u64,

    /// Unix timestamp in milliseconds when the cycle started.
    pub timestamp_ms: u64,

    /// Metrics per context, keyed by context id.
    pub contexts: BTreeMap<String, ContextMetrics>,

    pub aggregate: AggregateMetrics,
}

impl MetricsSample {
    /// Create a builder for constructing samples.
    pub fn builder() -> MetricsSampleBuilder {
        MetricsSampleBuilder::new()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Get metrics for a specific context.
    pub fn get(&self, context_id: &str) -> Option<&ContextMetrics> {
        self.contexts.get(context_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextMetrics)> {
        self.contexts.iter()
    }

    /// Resolve a context-scoped metric for one context.
    pub fn context_metric(&self, context_id: &str, path: MetricPath) -> Option<f64> {
        self.contexts.get(context_id)?.metric(path)
    }

    /// Resolve a metric across the whole sample.
    ///
    /// Aggregate paths read [`AggregateMetrics`]. Context paths are folded:
    /// counts and memory are summed, response time takes the worst context,
    /// health score takes the mean.
    pub fn aggregate_metric(&self, path: MetricPath) -> Option<f64> {
        match path {
            MetricPath::CpuUsage => self.aggregate.cpu_usage,
            MetricPath::NetworkLatency => self.aggregate.network_latency_ms,
            MetricPath::HealthScore => self.overall_health(),
            MetricPath::ResponseTime => self
                .contexts
                .values()
                .filter_map(|c| c.response_time_ms)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v)))),
            _ if path.scope() == MetricScope::Context => {
                let values: Vec<f64> = self.contexts.values().filter_map(|c| c.metric(path)).collect();
                if values.is_empty() {
                    None
                } else {
                    Some(values.iter().sum())
                }
            }
            _ => None,
        }
    }

    /// Mean health score across contexts, or `None` for an empty sample.
    pub fn overall_health(&self) -> Option<f64> {
        if self.contexts.is_empty() {
            return None;
        }
        let total: f64 = self.contexts.values().map(|c| c.health_score).sum();
        Some(total / self.contexts.len() as f64)
    }

    /// Context ids whose health check failed this cycle.
    pub fn unhealthy_contexts(&self) -> Vec<&str> {
        self.contexts
            .iter()
            .filter(|(_, c)| !c.is_healthy)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Total console errors across contexts.
    pub fn total_errors(&self) -> u64 {
        self.contexts.values().map(|c| c.error_count).sum()
    }
}

/// Clamp a value into `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Builder for `MetricsSample`.
#[derive(Debug, Default)]
pub struct MetricsSampleBuilder {
    sequence: u64,
    timestamp_ms: Option<u64>,
    contexts: BTreeMap<String, ContextMetrics>,
    aggregate: AggregateMetrics,
}

impl MetricsSampleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set a specific timestamp (milliseconds since Unix epoch).
    pub fn timestamp_ms(mut self, ts: u64) -> Self {
        self.timestamp_ms = Some(ts);
        self
    }

    /// Add a context with metrics built using a closure.
    pub fn context<F>(mut self, id: impl Into<String>, role: ContextRole, f: F) -> Self
    where
        F: FnOnce(ContextMetricsBuilder) -> ContextMetricsBuilder,
    {
        let metrics = f(ContextMetricsBuilder::new(role)).build();
        self.contexts.insert(id.into(), metrics);
        self
    }

    /// Add a context with pre-built metrics.
    pub fn context_metrics(mut self, id: impl Into<String>, mut metrics: ContextMetrics) -> Self {
        metrics.health_score = clamp_unit(metrics.health_score);
        self.contexts.insert(id.into(), metrics);
        self
    }

    pub fn aggregate(mut self, aggregate: AggregateMetrics) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn build(self) -> MetricsSample {
        MetricsSample {
            version: SCHEMA_VERSION,
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms.unwrap_or_else(crate::current_timestamp_ms),
            contexts: self.contexts,
            aggregate: self.aggregate,
        }
    }
}

/// Builder for `ContextMetrics`.
#[derive(Debug)]
pub struct ContextMetricsBuilder {
    metrics: ContextMetrics,
}

impl ContextMetricsBuilder {
    pub fn new(role: ContextRole) -> Self {
        Self {
            metrics: ContextMetrics {
                role,
                memory_usage_mb: None,
                response_time_ms: None,
                error_count: 0,
                network_requests: 0,
                issues: Vec::new(),
                health_score: 1.0,
                is_healthy: true,
                probe_status: ProbeStatus::Success,
            },
        }
    }

    pub fn memory_usage_mb(mut self, mb: f64) -> Self {
        self.metrics.memory_usage_mb = Some(mb);
        self
    }

    pub fn response_time_ms(mut self, ms: f64) -> Self {
        self.metrics.response_time_ms = Some(ms);
        self
    }

    pub fn error_count(mut self, count: u64) -> Self {
        self.metrics.error_count = count;
        self
    }

    pub fn network_requests(mut self, count: u64) -> Self {
        self.metrics.network_requests = count;
        self
    }

    pub fn issue(mut self, issue: impl Into<String>) -> Self {
        self.metrics.issues.push(issue.into());
        self
    }

    pub fn health_score(mut self, score: f64) -> Self {
        self.metrics.health_score = score;
        self
    }

    pub fn healthy(mut self, healthy: bool) -> Self {
        self.metrics.is_healthy = healthy;
        self
    }

    pub fn probe_status(mut self, status: ProbeStatus) -> Self {
        self.metrics.probe_status = status;
        self
    }

    /// Build the metrics. The health score is clamped into `[0, 1]`.
    pub fn build(mut self) -> ContextMetrics {
        self.metrics.health_score = clamp_unit(self.metrics.health_score);
        self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricsSample {
        MetricsSample::builder()
            .sequence(7)
            .timestamp_ms(1_703_160_000_000)
            .context("svc", ContextRole::BackgroundWorker, |c| {
                c.memory_usage_mb(40.0).response_time_ms(20.0).error_count(1).health_score(0.8)
            })
            .context("ui", ContextRole::UiSurface, |c| {
                c.memory_usage_mb(10.0).response_time_ms(90.0).health_score(0.4).healthy(false)
            })
            .build()
    }

    #[test]
    fn builder_sets_fields() {
        let s = sample();
        assert_eq!(s.len(), 2);
        assert_eq!(s.sequence, 7);
        assert_eq!(s.timestamp_ms, 1_703_160_000_000);
        assert_eq!(s.version, SCHEMA_VERSION);
    }

    #[test]
    fn health_score_is_clamped() {
        let m = ContextMetrics::builder(ContextRole::PageScript).health_score(1.7).build();
        assert_eq!(m.health_score, 1.0);

        let m = ContextMetrics::builder(ContextRole::PageScript).health_score(-0.2).build();
        assert_eq!(m.health_score, 0.0);

        let m = ContextMetrics::builder(ContextRole::PageScript).health_score(f64::NAN).build();
        assert_eq!(m.health_score, 0.0);
    }

    #[test]
    fn context_metric_resolution() {
        let s = sample();
        assert_eq!(s.context_metric("svc", MetricPath::ResponseTime), Some(20.0));
        assert_eq!(s.context_metric("svc", MetricPath::ErrorCount), Some(1.0));
        assert_eq!(s.context_metric("svc", MetricPath::CpuUsage), None);
        assert_eq!(s.context_metric("missing", MetricPath::ResponseTime), None);
    }

    #[test]
    fn aggregate_metric_folds_contexts() {
        let s = sample();
        assert_eq!(s.aggregate_metric(MetricPath::MemoryUsage), Some(50.0));
        assert_eq!(s.aggregate_metric(MetricPath::ResponseTime), Some(90.0));
        assert_eq!(s.aggregate_metric(MetricPath::ErrorCount), Some(1.0));
        let health = s.aggregate_metric(MetricPath::HealthScore).unwrap();
        assert!((health - 0.6).abs() < 1e-9);
        assert_eq!(s.aggregate_metric(MetricPath::CpuUsage), None);
    }

    #[test]
    fn unhealthy_contexts_listed() {
        assert_eq!(sample().unhealthy_contexts(), vec!["ui"]);
    }

    #[test]
    fn failed_metrics_are_unhealthy() {
        let m = ContextMetrics::failed(ContextRole::UiSurface, "probe timed out");
        assert!(!m.is_healthy);
        assert_eq!(m.health_score, 0.0);
        assert_eq!(m.probe_status, ProbeStatus::Failure);
        assert_eq!(m.issues, vec!["probe timed out".to_string()]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_roundtrip() {
        let s = sample();
        let json = serde_json::to_string(&s).unwrap();
        let parsed: MetricsSample = serde_json::from_str(&json).unwrap();
        assert_eq!(s, parsed);
    }
}
