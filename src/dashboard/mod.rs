//! Dashboard aggregation.
//!
//! The aggregator pulls every component's published state, assembles one
//! immutable [`DashboardSnapshot`] and keeps a ring of recent snapshots.
//! Building is a pure function of its sources: no clock is read, so the same
//! sources always give an equal snapshot.

mod recommendations;

pub use recommendations::derive as derive_recommendations;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ctxwatch_types::{
    Alert, Bottleneck, DashboardSnapshot, ExecutionContext, MetricsSample, PropagationChain,
    RecoveryAction, Route, SCHEMA_VERSION,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::DashboardConfig;
use crate::flow::FlaggedRoute;

/// Everything a snapshot is built from.
#[derive(Debug, Clone, Default)]
pub struct DashboardSources {
    pub sample: Option<Arc<MetricsSample>>,
    pub contexts: Arc<BTreeMap<String, ExecutionContext>>,
    /// Open alerts, most severe first.
    pub alerts: Arc<Vec<Alert>>,
    pub routes: Vec<Route>,
    pub flagged_routes: Vec<FlaggedRoute>,
    /// Chains ordered by first sighting.
    pub chains: Arc<Vec<PropagationChain>>,
    pub bottlenecks: Arc<Vec<Bottleneck>>,
    /// Recovery outcomes, oldest first.
    pub recoveries: Vec<RecoveryAction>,
}

impl DashboardSources {
    /// Latest timestamp found in any source.
    pub fn as_of_ms(&self) -> u64 {
        let sample = self.sample.as_ref().map(|s| s.timestamp_ms);
        let contexts = self.contexts.values().map(|c| c.last_activity_ms);
        let alerts = self
            .alerts
            .iter()
            .map(|a| a.last_triggered_ms.max(a.resolved_at_ms.unwrap_or(0)));
        let routes = self.routes.iter().map(|r| r.last_message_ms);
        let chains = self.chains.iter().map(|c| c.last_seen_ms);
        let bottlenecks = self.bottlenecks.iter().map(|b| b.detected_at_ms);
        let recoveries = self.recoveries.iter().map(|r| r.timestamp_ms);

        sample
            .into_iter()
            .chain(contexts)
            .chain(alerts)
            .chain(routes)
            .chain(chains)
            .chain(bottlenecks)
            .chain(recoveries)
            .max()
            .unwrap_or(0)
    }
}

/// Assemble a snapshot from its sources.
pub fn build_snapshot(sources: &DashboardSources, config: &DashboardConfig) -> DashboardSnapshot {
    let recent_chains = tail(&sources.chains, config.recent_chains);
    let recent_recoveries = tail(&sources.recoveries, config.recent_recoveries);

    DashboardSnapshot {
        version: SCHEMA_VERSION,
        as_of_ms: sources.as_of_ms(),
        latest_sample: sources.sample.as_deref().cloned(),
        contexts: sources.contexts.as_ref().clone(),
        active_alerts: sources.alerts.as_ref().clone(),
        routes: sources.routes.clone(),
        recent_chains,
        bottlenecks: sources.bottlenecks.as_ref().clone(),
        recent_recoveries,
        recommendations: recommendations::derive(sources),
        overall_health: sources.sample.as_ref().and_then(|s| s.overall_health()),
    }
}

fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}

/// Builds snapshots on demand and keeps a bounded ring of them.
#[derive(Debug)]
pub struct DashboardAggregator {
    config: DashboardConfig,
    ring: Mutex<VecDeque<Arc<DashboardSnapshot>>>,
}

impl DashboardAggregator {
    pub fn new(config: DashboardConfig) -> Self {
        Self {
            config,
            ring: Mutex::new(VecDeque::new()),
        }
    }

    /// Build a snapshot and push it onto the ring.
    ///
    /// A snapshot equal to the newest one in the ring is not pushed again.
    pub fn refresh(&self, sources: &DashboardSources) -> Arc<DashboardSnapshot> {
        let snapshot = build_snapshot(sources, &self.config);
        let mut ring = self.ring.lock();
        if let Some(last) = ring.back() {
            if **last == snapshot {
                return last.clone();
            }
        }
        let snapshot = Arc::new(snapshot);
        ring.push_back(snapshot.clone());
        while ring.len() > self.config.history_size.max(1) {
            ring.pop_front();
        }
        debug!(
            as_of_ms = snapshot.as_of_ms,
            alerts = snapshot.active_alerts.len(),
            recommendations = snapshot.recommendations.len(),
            "dashboard refreshed"
        );
        snapshot
    }

    pub fn latest(&self) -> Option<Arc<DashboardSnapshot>> {
        self.ring.lock().back().cloned()
    }

    /// Snapshots in the ring, oldest first.
    pub fn history(&self) -> Vec<Arc<DashboardSnapshot>> {
        self.ring.lock().iter().cloned().collect()
    }
}
