//! Metrics collection.
//!
//! One sampling cycle discovers contexts, probes every known or newly
//! discovered context concurrently, scores each one and publishes a single
//! immutable [`MetricsSample`] through a watch channel. Consumers read the
//! latest sample whenever they like and never hold up the collector.

mod health;

pub use health::HealthModel;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ctxwatch_adapters::{ProbeAdapter, ProbeData, ProbeFailure, ProbeFailureKind, ProbeResult};
use ctxwatch_types::{
    AggregateMetrics, ContextMetrics, ContextRole, ErrorEvent, ExecutionContext, MetricsSample,
};
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{HealthConfig, SamplingConfig};
use crate::error::EngineError;
use crate::state::Published;

/// Console errors copied into a context's issue list per cycle.
const MAX_ERROR_ISSUES: usize = 10;

/// What one sampling cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub sample: Arc<MetricsSample>,
    /// Console errors observed this cycle, in probe order.
    pub errors: Vec<ErrorEvent>,
    /// Contexts that went inactive this cycle.
    pub deactivated: Vec<String>,
    /// Contexts that answered again after being inactive.
    pub reactivated: Vec<String>,
}

#[derive(Debug, Clone)]
struct Candidate {
    role: ContextRole,
    url: Option<String>,
}

/// Runs sampling cycles and publishes their samples.
#[derive(Debug)]
pub struct MetricsCollector {
    adapter: ProbeAdapter,
    config: SamplingConfig,
    health: HealthModel,
    contexts: Published<BTreeMap<String, ExecutionContext>>,
    sequence: AtomicU64,
    error_sequence: AtomicU64,
    sender: watch::Sender<Option<Arc<MetricsSample>>>,
}

impl MetricsCollector {
    pub fn new(adapter: ProbeAdapter, config: SamplingConfig, health: HealthConfig) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            adapter,
            config,
            health: HealthModel::new(health),
            contexts: Published::default(),
            sequence: AtomicU64::new(0),
            error_sequence: AtomicU64::new(0),
            sender,
        }
    }

    /// Subscribe to published samples.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<MetricsSample>>> {
        self.sender.subscribe()
    }

    /// The most recently published sample.
    pub fn latest(&self) -> Option<Arc<MetricsSample>> {
        self.sender.borrow().clone()
    }

    /// Every context seen this session, active or not.
    pub fn contexts(&self) -> Arc<BTreeMap<String, ExecutionContext>> {
        self.contexts.load()
    }

    /// Run one sampling cycle and publish its sample.
    ///
    /// Never fails: a context whose probe fails is recorded as unhealthy with
    /// the reason in its issues.
    pub async fn run_cycle(&self, now_ms: u64) -> CycleReport {
        let candidates = self.candidates().await;
        let timeout = self.config.probe_timeout();

        let probes = candidates.iter().map(|(id, _)| async move {
            let result = self.adapter.sample(id, timeout).await;
            (id.clone(), result)
        });
        let results = join_all(probes).await;

        let inactive_after = self.config.inactive_after_failures;
        let mut metrics = BTreeMap::new();
        let mut errors = Vec::new();
        let mut durations = Vec::new();
        let mut deactivated = Vec::new();
        let mut reactivated = Vec::new();

        self.contexts.update(|known| {
            for (id, result) in results {
                let Some(candidate) = candidates.get(&id) else {
                    continue;
                };
                let (data, partial) = match result {
                    ProbeResult::Success(data) => (data, None),
                    ProbeResult::Partial(data, reason) => (data, Some(reason)),
                    ProbeResult::Failure(failure) => {
                        let Some(ctx) = known.get_mut(&id) else {
                            debug!(context = %id, error = %failure, "new context failed its first probe");
                            continue;
                        };
                        if ctx.record_failure(inactive_after) {
                            deactivated.push(id.clone());
                        }
                        let mut failed = ContextMetrics::failed(ctx.role, probe_issue(&id, &failure));
                        if !ctx.is_active {
                            failed.issues.push(format!(
                                "context inactive after {} consecutive failed probes",
                                ctx.consecutive_failures
                            ));
                        }
                        metrics.insert(id, failed);
                        continue;
                    }
                };

                let ctx = known
                    .entry(id.clone())
                    .or_insert_with(|| new_context(&id, candidate, now_ms));
                if !ctx.is_active {
                    reactivated.push(id.clone());
                }
                ctx.record_success(now_ms);
                durations.extend(data.network.iter().filter_map(|n| n.duration_ms));
                errors.extend(self.error_events(&id, &data, now_ms));
                metrics.insert(id, self.context_metrics(ctx.role, &data, partial));
            }
        });

        let aggregate = AggregateMetrics {
            cpu_usage: None,
            network_latency_ms: mean(&durations),
        };
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let sample = Arc::new(
            metrics
                .into_iter()
                .fold(
                    MetricsSample::builder()
                        .sequence(sequence)
                        .timestamp_ms(now_ms)
                        .aggregate(aggregate),
                    |builder, (id, m)| builder.context_metrics(id, m),
                )
                .build(),
        );

        for id in &deactivated {
            warn!(context = %id, "context marked inactive after {} failed probes", inactive_after);
        }
        for id in &reactivated {
            info!(context = %id, "context answering again");
        }
        debug!(
            sequence,
            contexts = sample.len(),
            unhealthy = sample.unhealthy_contexts().len(),
            errors = errors.len(),
            "sampling cycle complete"
        );

        self.sender.send_replace(Some(sample.clone()));

        CycleReport {
            sample,
            errors,
            deactivated,
            reactivated,
        }
    }

    /// Known contexts plus whatever the bridge lists now.
    async fn candidates(&self) -> BTreeMap<String, Candidate> {
        let mut candidates: BTreeMap<String, Candidate> = self
            .contexts
            .load()
            .iter()
            .map(|(id, ctx)| {
                (
                    id.clone(),
                    Candidate {
                        role: ctx.role,
                        url: ctx.url.clone(),
                    },
                )
            })
            .collect();

        match self.adapter.discover(self.config.discovery_timeout()).await {
            Ok(descriptors) => {
                for desc in descriptors {
                    match desc.role() {
                        Some(role) => {
                            candidates.entry(desc.id.clone()).or_insert(Candidate {
                                role,
                                url: desc.url.clone(),
                            });
                        }
                        None => {
                            debug!(context = %desc.id, kind = %desc.kind, "ignoring context of unknown kind");
                        }
                    }
                }
            }
            Err(failure) => {
                warn!(error = %failure, "context discovery failed, probing known contexts only");
            }
        }
        candidates
    }

    fn context_metrics(&self, role: ContextRole, data: &ProbeData, partial: Option<String>) -> ContextMetrics {
        let error_count = data.error_count();
        let score = self
            .health
            .score(data.memory_usage_mb, Some(data.response_time_ms), error_count);

        let mut builder = ContextMetrics::builder(role)
            .response_time_ms(data.response_time_ms)
            .error_count(error_count)
            .network_requests(data.network.len() as u64)
            .health_score(score)
            .healthy(self.health.is_healthy(score))
            .probe_status(if partial.is_some() {
                ctxwatch_types::ProbeStatus::Partial
            } else {
                ctxwatch_types::ProbeStatus::Success
            });

        if let Some(mb) = data.memory_usage_mb {
            builder = builder.memory_usage_mb(mb);
        }
        if let Some(reason) = partial {
            builder = builder.issue(reason);
        }
        let failed = data.failed_requests();
        if failed > 0 {
            builder = builder.issue(format!("{failed} failed network requests"));
        }
        for entry in data.error_entries().take(MAX_ERROR_ISSUES) {
            builder = builder.issue(format!("console error: {}", entry.text));
        }
        builder.build()
    }

    fn error_events(&self, context_id: &str, data: &ProbeData, now_ms: u64) -> Vec<ErrorEvent> {
        data.error_entries()
            .map(|entry| {
                let seq = self.error_sequence.fetch_add(1, Ordering::Relaxed) + 1;
                let timestamp = if entry.timestamp_ms > 0 {
                    entry.timestamp_ms
                } else {
                    now_ms
                };
                let mut event = ErrorEvent::new(
                    format!("{context_id}-err-{seq}"),
                    context_id,
                    entry.text.clone(),
                    timestamp,
                );
                event.correlation_id = entry.correlation_id().map(str::to_string);
                event.handled = entry.is_handled();
                event
            })
            .collect()
    }
}

fn new_context(id: &str, candidate: &Candidate, now_ms: u64) -> ExecutionContext {
    let ctx = ExecutionContext::new(id, candidate.role, now_ms);
    match &candidate.url {
        Some(url) => ctx.with_url(url.clone()),
        None => ctx,
    }
}

/// Issue string for a failed probe.
fn probe_issue(context: &str, failure: &ProbeFailure) -> String {
    let err = match failure.kind {
        ProbeFailureKind::Timeout => EngineError::ProbeTimeout {
            context: context.to_string(),
        },
        ProbeFailureKind::InvalidMetric => EngineError::InvalidMetric {
            path: "metrics".to_string(),
            reason: failure.reason.clone(),
        },
        ProbeFailureKind::Unavailable | ProbeFailureKind::ContextGone => EngineError::ProbeUnavailable {
            context: context.to_string(),
            reason: failure.to_string(),
        },
    };
    err.to_string()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ctxwatch_adapters::{BridgeError, ConsoleEntry, ConsoleLevel, InstrumentationBridge};
    use ctxwatch_types::ProbeStatus;

    use super::*;
    use crate::testing::ScriptedBridge;

    fn collector(bridge: &Arc<ScriptedBridge>) -> MetricsCollector {
        let bridge: Arc<dyn InstrumentationBridge> = bridge.clone();
        let adapter = ProbeAdapter::builder(bridge)
            .backoff(Duration::from_millis(1))
            .build();
        MetricsCollector::new(adapter, SamplingConfig::default(), HealthConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn discovers_and_scores_contexts() {
        let bridge = Arc::new(ScriptedBridge::default());
        bridge.add("sw", "service_worker");
        bridge.add("tab-1", "content_script");
        bridge.add("mystery", "gpu_process");
        let collector = collector(&bridge);
        let mut rx = collector.subscribe();

        let report = collector.run_cycle(1_000).await;
        let sample = &report.sample;

        assert_eq!(sample.sequence, 1);
        assert_eq!(sample.timestamp_ms, 1_000);
        assert_eq!(sample.len(), 2);
        assert!(sample.get("mystery").is_none());

        let sw = sample.get("sw").unwrap();
        assert_eq!(sw.role, ContextRole::BackgroundWorker);
        assert_eq!(sw.memory_usage_mb, Some(16.0));
        assert_eq!(sw.probe_status, ProbeStatus::Success);
        assert!(sw.is_healthy);
        assert!((0.0..=1.0).contains(&sw.health_score));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().sequence, 1);
        assert_eq!(collector.contexts().len(), 2);

        let report = collector.run_cycle(2_000).await;
        assert_eq!(report.sample.sequence, 2);
        assert_eq!(collector.latest().unwrap().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn new_context_failing_first_probe_is_left_out() {
        let bridge = Arc::new(ScriptedBridge::default());
        bridge.add("sw", "service_worker");
        bridge.add("popup", "popup");
        bridge.fail("popup", Some(BridgeError::ContextGone("popup".into())));
        let collector = collector(&bridge);

        let report = collector.run_cycle(1_000).await;
        assert!(report.sample.get("popup").is_none());
        assert!(!collector.contexts().contains_key("popup"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_accumulate_until_inactive() {
        let bridge = Arc::new(ScriptedBridge::default());
        bridge.add("sw", "service_worker");
        let collector = collector(&bridge);
        collector.run_cycle(1_000).await;

        bridge.fail("sw", Some(BridgeError::Unavailable("port closed".into())));
        let mut deactivated = Vec::new();
        for t in 2..=4 {
            let report = collector.run_cycle(t * 1_000).await;
            let sw = report.sample.get("sw").unwrap();
            assert_eq!(sw.probe_status, ProbeStatus::Failure);
            assert_eq!(sw.health_score, 0.0);
            deactivated.extend(report.deactivated);
        }
        assert_eq!(deactivated, vec!["sw"]);

        let sw = &collector.contexts()["sw"];
        assert!(!sw.is_active);
        assert_eq!(sw.last_activity_ms, 1_000);

        bridge.fail("sw", None);
        let report = collector.run_cycle(5_000).await;
        assert_eq!(report.reactivated, vec!["sw"]);
        assert_eq!(collector.contexts()["sw"].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn console_errors_become_error_events() {
        let bridge = Arc::new(ScriptedBridge::default());
        bridge.add("sw", "service_worker");
        bridge.push_console("sw", ConsoleEntry::new(ConsoleLevel::Error, "port closed corr=abc", 900));
        bridge.push_console("sw", ConsoleEntry::new(ConsoleLevel::Warn, "slow", 950));
        bridge.push_console("sw", ConsoleEntry::new(ConsoleLevel::Error, "[handled] retried", 0));
        let collector = collector(&bridge);

        let report = collector.run_cycle(1_000).await;
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].correlation_id.as_deref(), Some("abc"));
        assert_eq!(report.errors[0].timestamp_ms, 900);
        assert!(report.errors[1].handled);
        assert_eq!(report.errors[1].timestamp_ms, 1_000);
        assert_ne!(report.errors[0].id, report.errors[1].id);

        let sw = report.sample.get("sw").unwrap();
        assert_eq!(sw.error_count, 2);
        assert!(sw.issues.iter().any(|i| i.contains("port closed")));

        // Console output is drained by the bridge
        let report = collector.run_cycle(2_000).await;
        assert!(report.errors.is_empty());
    }
}
