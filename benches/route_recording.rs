use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ctxwatch::alerts::{AlertEngine, EvaluationInput, TrackerMetrics};
use ctxwatch::config::{AlertsConfig, FlowConfig};
use ctxwatch::flow::FlowTracker;
use ctxwatch::{ContextRole, MessageEvent, MetricsSample};

/// Benchmark recording a message on an existing route (hot path)
fn bench_record_message(c: &mut Criterion) {
    let tracker = FlowTracker::new(FlowConfig::default());
    let event = MessageEvent::new("content-script", "service-worker", 4.0, true, 1);

    c.bench_function("record_message", |b| {
        b.iter(|| tracker.record(black_box(&event)));
    });
}

/// Benchmark recording across a growing number of routes
fn bench_record_many_routes(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_many_routes");

    for route_count in [1usize, 10, 50].iter() {
        let tracker = FlowTracker::new(FlowConfig::default());
        let events: Vec<MessageEvent> = (0..*route_count)
            .map(|i| MessageEvent::new(format!("ctx-{i}"), "service-worker", 4.0, i % 3 != 0, 1))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(route_count), &events, |b, events| {
            b.iter(|| {
                for event in events {
                    tracker.record(black_box(event));
                }
            });
        });
    }
    group.finish();
}

fn sample(sequence: u64, contexts: usize) -> Arc<MetricsSample> {
    let mut builder = MetricsSample::builder().sequence(sequence).timestamp_ms(sequence * 1_000);
    for i in 0..contexts {
        builder = builder.context(format!("ctx-{i}"), ContextRole::PageScript, |c| {
            c.memory_usage_mb(64.0 + i as f64)
                .response_time_ms(12.0)
                .health_score(0.9)
        });
    }
    Arc::new(builder.build())
}

/// Benchmark one evaluation of the default rule set
fn bench_rule_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_evaluation");

    for contexts in [4usize, 16, 64].iter() {
        let engine = AlertEngine::new(&AlertsConfig::default());
        let window: Vec<Arc<MetricsSample>> = (1..=5).map(|s| sample(s, *contexts)).collect();
        let latest = window[window.len() - 1].clone();

        group.bench_with_input(BenchmarkId::from_parameter(contexts), &window, |b, window| {
            b.iter(|| {
                let input = EvaluationInput {
                    sample: &latest,
                    window,
                    trackers: TrackerMetrics::default(),
                };
                black_box(engine.evaluate(&input, 5_000))
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_record_message,
    bench_record_many_routes,
    bench_rule_evaluation
);
criterion_main!(benches);
