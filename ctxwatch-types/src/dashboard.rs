//! DashboardSnapshot - the composite view handed to presentation layers.

use std::collections::BTreeMap;

use crate::{
    Alert, AlertCategory, Bottleneck, ExecutionContext, MetricsSample, PropagationChain,
    RecoveryAction, Route, Severity,
};

/// A derived suggestion for the operator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Recommendation {
    pub priority: Severity,
    pub category: AlertCategory,
    /// Context or route the recommendation concerns.
    pub subject: String,
    pub message: String,
}

/// Immutable composite of every component's latest published state.
///
/// Snapshots carry no wall-clock fields of their own: `as_of_ms` is derived
/// from the sources, so building twice from unchanged state yields equal
/// values.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DashboardSnapshot {
    pub version: u32,
    /// Latest timestamp found among the sources.
    pub as_of_ms: u64,
    pub latest_sample: Option<MetricsSample>,
    /// Tracked contexts keyed by id, including inactive ones.
    pub contexts: BTreeMap<String, ExecutionContext>,
    /// Active and acknowledged alerts, most severe first.
    pub active_alerts: Vec<Alert>,
    pub routes: Vec<Route>,
    pub recent_chains: Vec<PropagationChain>,
    pub bottlenecks: Vec<Bottleneck>,
    pub recent_recoveries: Vec<RecoveryAction>,
    pub recommendations: Vec<Recommendation>,
    /// Mean health of the latest sample, if any.
    pub overall_health: Option<f64>,
}

impl DashboardSnapshot {
    /// Contexts currently marked inactive.
    pub fn inactive_contexts(&self) -> Vec<&str> {
        self.contexts
            .values()
            .filter(|c| !c.is_active)
            .map(|c| c.id.as_str())
            .collect()
    }

    /// Highest severity among open alerts.
    pub fn worst_severity(&self) -> Option<Severity> {
        self.active_alerts.iter().map(|a| a.severity).max()
    }

    pub fn unhandled_chains(&self) -> impl Iterator<Item = &PropagationChain> {
        self.recent_chains.iter().filter(|c| c.finalized && !c.handled)
    }
}
