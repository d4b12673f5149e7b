//! The telemetry engine and its background loops.
//!
//! [`TelemetryEngine`] owns every component and wires them together by
//! hand. [`TelemetryEngine::start`] spawns four tasks:
//!
//! - **sampling**: one collector cycle per tick, then history, error events,
//!   chain finalization, alert evaluation and recovery dispatch, in that order
//! - **analysis**: one bottleneck pass per tick over the sample history
//! - **dashboard**: one snapshot per tick
//! - **event pump**: escalates alerts whose recovery failed
//!
//! All four stop when [`EngineHandle::shutdown`] is called. Observed messages
//! and errors reach the flow and propagation trackers synchronously, before
//! they are published, so a lagging bus subscriber never loses tracker data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ctxwatch_adapters::{InstrumentationBridge, ProbeAdapter};
use ctxwatch_types::{
    current_timestamp_ms, Alert, Bottleneck, DashboardSnapshot, ErrorEvent, ExecutionContext,
    MessageEvent, MetricsSample, PropagationChain, RecoveryAction, Route,
};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::{AlertEngine, AlertTransition, EvaluationInput, TrackerMetrics};
use crate::bottleneck::BottleneckDetector;
use crate::collector::MetricsCollector;
use crate::config::EngineConfig;
use crate::dashboard::{DashboardAggregator, DashboardSources};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::flow::{FlaggedRoute, FlowTracker};
use crate::history::SampleHistory;
use crate::propagation::PropagationTracker;
use crate::recovery::{BridgeRecoveryHandler, RecoveryExecutor, RecoveryHandler};

/// The multi-context telemetry and alerting engine.
#[derive(Debug)]
pub struct TelemetryEngine {
    config: EngineConfig,
    bus: EventBus,
    collector: MetricsCollector,
    history: RwLock<SampleHistory>,
    flow: FlowTracker,
    propagation: PropagationTracker,
    alerts: AlertEngine,
    recovery: RecoveryExecutor,
    bottlenecks: BottleneckDetector,
    dashboard: DashboardAggregator,
    /// Longest sample window any rule looks back over.
    rule_window: usize,
}

impl TelemetryEngine {
    /// Build an engine that runs recovery actions through the bridge.
    pub fn new(config: EngineConfig, bridge: Arc<dyn InstrumentationBridge>) -> Result<Self> {
        let adapter = probe_adapter(&config, bridge);
        let handler = Arc::new(BridgeRecoveryHandler::new(
            adapter.clone(),
            config.recovery.expressions.clone(),
            config.recovery.action_timeout(),
        ));
        Self::assemble(config, adapter, handler)
    }

    /// Build an engine with a custom recovery handler.
    pub fn with_recovery_handler(
        config: EngineConfig,
        bridge: Arc<dyn InstrumentationBridge>,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Result<Self> {
        let adapter = probe_adapter(&config, bridge);
        Self::assemble(config, adapter, handler)
    }

    fn assemble(
        config: EngineConfig,
        adapter: ProbeAdapter,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::default();
        let rule_window = config
            .alerts
            .rules
            .iter()
            .map(|r| r.condition.window())
            .max()
            .unwrap_or(1);

        Ok(Self {
            collector: MetricsCollector::new(adapter, config.sampling.clone(), config.health.clone()),
            history: RwLock::new(SampleHistory::new(config.history_capacity())),
            flow: FlowTracker::new(config.flow.clone()),
            propagation: PropagationTracker::new(config.propagation.clone()),
            alerts: AlertEngine::new(&config.alerts),
            recovery: RecoveryExecutor::new(&config.recovery, handler, bus.clone()),
            bottlenecks: BottleneckDetector::new(config.bottleneck.clone()),
            dashboard: DashboardAggregator::new(config.dashboard.clone()),
            rule_window,
            bus,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to everything published on the internal bus.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Subscribe to published samples.
    pub fn subscribe_samples(&self) -> watch::Receiver<Option<Arc<MetricsSample>>> {
        self.collector.subscribe()
    }

    /// Spawn the background loops.
    pub fn start(self: &Arc<Self>) -> EngineHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        // Subscribe before anything can publish.
        let events = self.bus.subscribe();

        let tasks = vec![
            tokio::spawn(event_pump(self.clone(), events, stop_rx.clone())),
            tokio::spawn(sampling_loop(self.clone(), stop_rx.clone())),
            tokio::spawn(analysis_loop(self.clone(), stop_rx.clone())),
            tokio::spawn(dashboard_loop(self.clone(), stop_rx)),
        ];
        info!(
            interval_ms = self.config.sampling.interval_ms,
            rules = self.alerts.rules().len(),
            "telemetry engine started"
        );

        EngineHandle {
            stop: stop_tx,
            tasks,
            engine: self.clone(),
        }
    }

    /// Run one sampling cycle and everything that follows from it.
    pub async fn run_sampling_cycle(&self, now_ms: u64) -> Arc<MetricsSample> {
        let report = self.collector.run_cycle(now_ms).await;
        let sample = report.sample;

        let window = {
            let mut history = self.history.write();
            history.record(sample.clone());
            history.last_n(self.rule_window)
        };

        self.bus.publish(EngineEvent::SampleCollected(sample.clone()));
        for error in report.errors {
            self.record_error(error);
        }
        for context_id in report.deactivated {
            self.bus.publish(EngineEvent::ContextInactive { context_id });
        }
        for context_id in report.reactivated {
            self.bus.publish(EngineEvent::ContextReactivated { context_id });
        }

        for chain in self.propagation.finalize_quiet(now_ms) {
            if !chain.handled {
                self.bus.publish(EngineEvent::UnhandledChain(chain));
            }
        }

        let trackers = TrackerMetrics {
            flagged_routes: self.flow.flagged_routes().len() as u64,
            unhandled_chains: self.propagation.recent_unhandled(now_ms),
        };
        let input = EvaluationInput {
            sample: &sample,
            window: &window,
            trackers,
        };
        for transition in self.alerts.evaluate(&input, now_ms) {
            match transition {
                AlertTransition::Activated(alert) => {
                    self.recovery.dispatch(&alert, now_ms);
                    self.bus.publish(EngineEvent::AlertRaised(alert));
                }
                AlertTransition::Reopened(alert) => {
                    self.bus.publish(EngineEvent::AlertRaised(alert));
                }
                AlertTransition::AutoResolved(alert) => {
                    self.bus.publish(EngineEvent::AlertResolved(alert));
                }
                AlertTransition::Retriggered(_) => {}
            }
        }

        sample
    }

    /// Run one bottleneck pass over the retained history.
    pub fn run_analysis_pass(&self, now_ms: u64) -> Vec<Bottleneck> {
        let samples = self.history.read().last_n(self.bottlenecks.window_len());
        self.bottlenecks.analyze(&samples, now_ms)
    }

    /// Build a snapshot from current state and add it to the ring.
    pub fn refresh_dashboard(&self) -> Arc<DashboardSnapshot> {
        self.dashboard.refresh(&self.dashboard_sources())
    }

    fn dashboard_sources(&self) -> DashboardSources {
        DashboardSources {
            sample: self.collector.latest(),
            contexts: self.collector.contexts(),
            alerts: self.alerts.published(),
            routes: self.flow.routes(),
            flagged_routes: self.flow.flagged_routes(),
            chains: self.propagation.chains(),
            bottlenecks: self.bottlenecks.current(),
            recoveries: self.recovery.history(),
        }
    }

    /// React to one bus event.
    ///
    /// The event pump calls this for every event; callers that don't start
    /// the loops can drive the engine with it directly. Tracker updates don't
    /// go through here: they happen when the message or error is observed.
    pub fn process_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::RecoveryFailed(action) => {
                if let Err(e) = self.alerts.escalate(&action.alert_id) {
                    debug!(alert = %action.alert_id, error = %e, "escalation skipped");
                }
            }
            EngineEvent::ContextInactive { context_id } => {
                debug!(context = %context_id, "context inactive");
            }
            _ => {}
        }
    }

    /// Report an observed inter-context message.
    pub fn observe_message(&self, event: MessageEvent) {
        self.flow.record(&event);
        self.bus.publish(EngineEvent::MessageObserved(event));
    }

    /// Report an observed error.
    pub fn observe_error(&self, event: ErrorEvent) {
        self.record_error(event);
    }

    fn record_error(&self, event: ErrorEvent) {
        let evicted = self
            .propagation
            .record(event.clone(), |a, b| self.flow.connected(a, b));
        self.bus.publish(EngineEvent::ErrorObserved(event));
        if let Some(chain) = evicted.filter(|c| !c.handled) {
            self.bus.publish(EngineEvent::UnhandledChain(chain));
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The most recent dashboard snapshot.
    pub fn latest_snapshot(&self) -> Option<Arc<DashboardSnapshot>> {
        self.dashboard.latest()
    }

    /// Past snapshots, oldest first.
    pub fn snapshot_history(&self) -> Vec<Arc<DashboardSnapshot>> {
        self.dashboard.history()
    }

    /// Open alerts, most severe first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    pub fn recently_closed_alerts(&self) -> Vec<Alert> {
        self.alerts.recently_closed()
    }

    pub fn route_statistics(&self, source: &str, target: &str) -> Option<Route> {
        self.flow.route(source, target)
    }

    pub fn flagged_routes(&self) -> Vec<FlaggedRoute> {
        self.flow.flagged_routes()
    }

    /// Chains ordered by first sighting, open ones included.
    pub fn propagation_chains(&self) -> Arc<Vec<PropagationChain>> {
        self.propagation.chains()
    }

    pub fn bottlenecks(&self) -> Arc<Vec<Bottleneck>> {
        self.bottlenecks.current()
    }

    pub fn recovery_history(&self) -> Vec<RecoveryAction> {
        self.recovery.history()
    }

    pub fn latest_sample(&self) -> Option<Arc<MetricsSample>> {
        self.collector.latest()
    }

    pub fn contexts(&self) -> Arc<BTreeMap<String, ExecutionContext>> {
        self.collector.contexts()
    }

    /// Health sparkline for a context over the last `n` samples (levels 0-7).
    pub fn health_sparkline(&self, context_id: &str, n: usize) -> Vec<u8> {
        self.history.read().health_sparkline(context_id, n)
    }

    /// The last `limit` samples as a JSON array, oldest first.
    pub fn export_metrics_history(&self, limit: usize) -> serde_json::Result<String> {
        self.history.read().to_json(limit)
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    pub fn acknowledge_alert(&self, alert_id: &str) -> Result<Alert> {
        self.alerts.acknowledge(alert_id, current_timestamp_ms())
    }

    pub fn resolve_alert(&self, alert_id: &str) -> Result<Alert> {
        let alert = self.alerts.resolve(alert_id, current_timestamp_ms())?;
        self.bus.publish(EngineEvent::AlertResolved(alert.clone()));
        Ok(alert)
    }

    /// Wait for outstanding recovery actions.
    pub async fn drain_recoveries(&self) {
        self.recovery.drain().await;
    }
}

fn probe_adapter(config: &EngineConfig, bridge: Arc<dyn InstrumentationBridge>) -> ProbeAdapter {
    let sampling = &config.sampling;
    let mut builder = ProbeAdapter::builder(bridge)
        .max_retries(sampling.max_retries)
        .backoff(Duration::from_millis(sampling.retry_backoff_ms))
        .capture_structure(sampling.capture_structure);
    if let Some(expression) = &sampling.metrics_expression {
        builder = builder.metrics_expression(expression.clone());
    }
    builder.build()
}

/// Handle to a started engine.
#[derive(Debug)]
pub struct EngineHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    engine: Arc<TelemetryEngine>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<TelemetryEngine> {
        &self.engine
    }

    /// Stop every loop, then wait for outstanding recovery actions.
    ///
    /// A sampling cycle already in progress runs to completion first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        self.engine.drain_recoveries().await;
        info!("telemetry engine stopped");
    }
}

async fn sampling_loop(engine: Arc<TelemetryEngine>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(engine.config.sampling.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.run_sampling_cycle(current_timestamp_ms()).await;
            }
            _ = stop.changed() => break,
        }
    }
    debug!("sampling loop stopped");
}

async fn analysis_loop(engine: Arc<TelemetryEngine>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(engine.config.bottleneck.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately, before there is any history.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.run_analysis_pass(current_timestamp_ms());
            }
            _ = stop.changed() => break,
        }
    }
    debug!("analysis loop stopped");
}

async fn dashboard_loop(engine: Arc<TelemetryEngine>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(engine.config.dashboard.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.refresh_dashboard();
            }
            _ = stop.changed() => break,
        }
    }
    debug!("dashboard loop stopped");
}

async fn event_pump(
    engine: Arc<TelemetryEngine>,
    mut events: broadcast::Receiver<EngineEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => engine.process_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event pump lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stop.changed() => break,
        }
    }
    debug!("event pump stopped");
}

#[cfg(test)]
mod tests {
    use ctxwatch_adapters::{BridgeError, ConsoleEntry, ConsoleLevel};
    use ctxwatch_types::{AlertState, BottleneckKind, RecoveryActionKind, Severity};
    use serde_json::Value;
    use tokio_test::assert_err;

    use super::*;
    use crate::testing::ScriptedBridge;

    const SECOND: u64 = 1_000;

    fn engine_with(config: EngineConfig, bridge: &Arc<ScriptedBridge>) -> TelemetryEngine {
        let bridge: Arc<dyn InstrumentationBridge> = bridge.clone();
        TelemetryEngine::new(config, bridge).unwrap()
    }

    fn bridge() -> Arc<ScriptedBridge> {
        let bridge = Arc::new(ScriptedBridge::default());
        bridge.add("sw", "service_worker");
        bridge.add("offscreen", "offscreen");
        bridge.add("popup", "popup");
        bridge
    }

    /// Deliver everything waiting on a receiver to the engine.
    fn pump(engine: &TelemetryEngine, rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            engine.process_event(&event);
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn slow_context_raises_one_alert() {
        let mut config = EngineConfig::default();
        config.sampling.probe_timeout_ms = 5_000;
        let bridge = bridge();
        bridge.set_delay("sw", 3_000);
        let engine = engine_with(config, &bridge);

        for cycle in 1..=5 {
            engine.run_sampling_cycle(cycle * SECOND).await;
        }

        let slow: Vec<Alert> = engine
            .active_alerts()
            .into_iter()
            .filter(|a| a.rule_id == "slow-response")
            .collect();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].target, "sw");
        assert_eq!(slow[0].trigger_count, 5);
        assert_eq!(slow[0].state, AlertState::Active);

        let sample = engine.latest_sample().unwrap();
        assert!(sample.get("sw").unwrap().response_time_ms.unwrap() >= 3_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_deactivate_only_that_context() {
        let bridge = bridge();
        let engine = engine_with(EngineConfig::default(), &bridge);
        let mut rx = engine.subscribe();

        engine.run_sampling_cycle(SECOND).await;
        bridge.set_delay("popup", 10_000);
        bridge.fail("popup", Some(BridgeError::Timeout));

        for cycle in 2..=4 {
            engine.run_sampling_cycle(cycle * SECOND).await;
        }

        let contexts = engine.contexts();
        assert!(!contexts["popup"].is_active);
        assert_eq!(contexts["popup"].consecutive_failures, 3);
        assert!(contexts["sw"].is_active);
        assert!(contexts["offscreen"].is_active);

        let sample = engine.latest_sample().unwrap();
        let popup = sample.get("popup").unwrap();
        assert!(!popup.is_healthy);
        assert_eq!(popup.health_score, 0.0);
        assert!(popup.issues[0].contains("timed out"), "{:?}", popup.issues);
        assert!(sample.get("sw").unwrap().is_healthy);

        let events = pump(&engine, &mut rx);
        assert!(events.iter().any(
            |e| matches!(e, EngineEvent::ContextInactive { context_id } if context_id == "popup")
        ));

        // Recovery brings it back
        bridge.fail("popup", None);
        bridge.set_delay("popup", 0);
        engine.run_sampling_cycle(5 * SECOND).await;
        assert!(engine.contexts()["popup"].is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_route_is_flagged_and_alerted() {
        let bridge = bridge();
        let engine = engine_with(EngineConfig::default(), &bridge);

        for i in 0..10 {
            engine.observe_message(MessageEvent::new(
                "content-script",
                "service-worker",
                12.0,
                i < 2,
                i,
            ));
        }

        let route = engine.route_statistics("content-script", "service-worker").unwrap();
        assert_eq!(route.total_messages, 10);
        assert!((route.success_rate() - 0.2).abs() < 1e-9);
        assert_eq!(engine.flagged_routes().len(), 1);

        engine.run_sampling_cycle(SECOND).await;
        assert!(engine
            .active_alerts()
            .iter()
            .any(|a| a.rule_id == "broken-routes" && a.target == "aggregate"));
    }

    #[tokio::test(start_paused = true)]
    async fn correlated_console_errors_form_handled_chain() {
        let bridge = bridge();
        let engine = engine_with(EngineConfig::default(), &bridge);
        let mut rx = engine.subscribe();

        bridge.push_console(
            "offscreen",
            ConsoleEntry::new(ConsoleLevel::Error, "fetch failed corr=X", 1_000),
        );
        bridge.push_console(
            "sw",
            ConsoleEntry::new(ConsoleLevel::Error, "retry scheduled corr=X [handled]", 1_050),
        );
        engine.run_sampling_cycle(1_100).await;
        pump(&engine, &mut rx);

        engine.run_sampling_cycle(1_050 + 5_000).await;
        let events = pump(&engine, &mut rx);
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::UnhandledChain(_))));

        let chains = engine.propagation_chains();
        assert_eq!(chains.len(), 1);
        let chain = &chains[0];
        assert!(chain.finalized);
        assert!(chain.handled);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.contexts, vec!["offscreen", "sw"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_chain_is_reported() {
        let bridge = bridge();
        let engine = engine_with(EngineConfig::default(), &bridge);
        let mut rx = engine.subscribe();

        engine.observe_error(ErrorEvent::new("e1", "sw", "boom", 1_000));
        engine.run_sampling_cycle(7_000).await;

        let events = pump(&engine, &mut rx);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::UnhandledChain(_))));
        assert!(engine
            .active_alerts()
            .iter()
            .any(|a| a.rule_id == "unhandled-errors"));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_growth_becomes_bottleneck() {
        let mut config = EngineConfig::default();
        config.bottleneck.baseline_window = 20;
        config.bottleneck.min_baseline_samples = 10;
        let bridge = bridge();
        bridge.set_memory("sw", 100.0);
        let engine = engine_with(config, &bridge);

        for cycle in 1..=20 {
            engine.run_sampling_cycle(cycle * SECOND).await;
        }
        bridge.set_memory("sw", 150.0);
        for cycle in 21..=25 {
            engine.run_sampling_cycle(cycle * SECOND).await;
        }

        assert!(engine.run_analysis_pass(30 * SECOND).is_empty());
        assert!(engine.run_analysis_pass(60 * SECOND).is_empty());
        let found = engine.run_analysis_pass(90 * SECOND);

        let sw: Vec<&Bottleneck> = found.iter().filter(|b| b.context_id == "sw").collect();
        assert_eq!(sw.len(), 1);
        assert_eq!(sw[0].kind, BottleneckKind::Memory);
        assert!((sw[0].estimated_slowdown_pct - 50.0).abs() < 1e-6);
        assert_eq!(engine.bottlenecks().len(), found.len());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_escalates_alert() {
        let bridge = bridge();
        bridge.set_memory("sw", 300.0);
        bridge.set_action_result(Value::Bool(false));
        let engine = engine_with(EngineConfig::default(), &bridge);
        let mut rx = engine.subscribe();

        engine.run_sampling_cycle(SECOND).await;
        engine.drain_recoveries().await;
        let events = pump(&engine, &mut rx);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::RecoveryFailed(_))));

        let executed = bridge.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "sw");

        let history = engine.recovery_history();
        assert_eq!(history[0].kind, RecoveryActionKind::ClearCache);
        assert!(!history[0].outcome.is_success());

        let alert = engine
            .active_alerts()
            .into_iter()
            .find(|a| a.rule_id == "high-memory")
            .unwrap();
        assert_eq!(alert.severity, Severity::Error);
        assert_eq!(alert.escalations, 1);

        // Retriggering does not run recovery again
        engine.run_sampling_cycle(2 * SECOND).await;
        engine.drain_recoveries().await;
        assert_eq!(bridge.executed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_actions_and_exports() {
        let bridge = bridge();
        bridge.set_memory("popup", 400.0);
        let engine = engine_with(EngineConfig::default(), &bridge);

        for cycle in 1..=3 {
            engine.run_sampling_cycle(cycle * SECOND).await;
        }

        let id = engine.active_alerts()[0].id.clone();
        assert_eq!(engine.acknowledge_alert(&id).unwrap().state, AlertState::Acknowledged);
        assert_eq!(engine.resolve_alert(&id).unwrap().state, AlertState::Resolved);
        assert_err!(engine.resolve_alert("missing"));

        let json = engine.export_metrics_history(2).unwrap();
        let exported: Vec<MetricsSample> = serde_json::from_str(&json).unwrap();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[1].sequence, 3);

        assert_eq!(engine.health_sparkline("sw", 10).len(), 3);

        engine.drain_recoveries().await;
        let snapshot = engine.refresh_dashboard();
        assert_eq!(snapshot.as_of_ms, 3 * SECOND);
        assert_eq!(snapshot.contexts.len(), 3);
        assert_eq!(engine.refresh_dashboard(), snapshot);
        assert_eq!(engine.snapshot_history().len(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.dashboard.history_size = 0;
        let bridge: Arc<dyn InstrumentationBridge> = Arc::new(ScriptedBridge::default());
        assert_err!(TelemetryEngine::new(config, bridge));
    }

    #[tokio::test(start_paused = true)]
    async fn loops_run_until_shutdown() {
        let bridge = bridge();
        let engine = Arc::new(engine_with(EngineConfig::default(), &bridge));
        let handle = engine.start();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        engine.observe_message(MessageEvent::new("sw", "popup", 4.0, true, 1));
        engine.observe_error(ErrorEvent::new("e1", "popup", "boom", 1));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(engine.latest_sample().unwrap().sequence >= 3);
        assert!(engine.latest_snapshot().is_some());
        assert_eq!(engine.route_statistics("sw", "popup").unwrap().total_messages, 1);
        assert_eq!(engine.propagation_chains().len(), 1);

        handle.shutdown().await;
        let sequence = engine.latest_sample().unwrap().sequence;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.latest_sample().unwrap().sequence, sequence);
    }

    #[tokio::test(start_paused = true)]
    async fn message_bursts_beyond_bus_capacity_are_all_counted() {
        let bridge = bridge();
        let engine = Arc::new(engine_with(EngineConfig::default(), &bridge));
        let handle = engine.start();
        let burst = 2 * crate::events::DEFAULT_BUS_CAPACITY as u64;

        for i in 0..burst {
            engine.observe_message(MessageEvent::new("cs", "sw", 3.0, true, i));
        }
        for i in 0..burst {
            engine.observe_error(
                ErrorEvent::new(format!("e{i}"), "cs", "boom", 1_000).with_correlation("burst"),
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.route_statistics("cs", "sw").unwrap().total_messages, burst);
        let chains = engine.propagation_chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].events.len() as u64, burst);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_unhandled_chain_is_published() {
        let mut config = EngineConfig::default();
        config.propagation.max_open_chains = 1;
        let bridge = bridge();
        let engine = engine_with(config, &bridge);
        let mut rx = engine.subscribe();

        engine.observe_error(ErrorEvent::new("e1", "sw", "boom", 1_000).with_correlation("a"));
        engine.observe_error(ErrorEvent::new("e2", "popup", "boom", 1_100).with_correlation("b"));

        let unhandled: Vec<PropagationChain> = pump(&engine, &mut rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::UnhandledChain(chain) => Some(chain),
                _ => None,
            })
            .collect();
        assert_eq!(unhandled.len(), 1);
        assert_eq!(unhandled[0].origin_error_id, "e1");
    }
}
