//! Automatic recovery.
//!
//! When an alert activates, the first matching policy picks at most one
//! corrective action. Actions run in the background through a
//! [`RecoveryHandler`]; each (action, context) pair is suppressed for a
//! window after it is dispatched so a flapping alert cannot hammer a context.
//! Outcomes are kept in a bounded history and published on the event bus.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ctxwatch_adapters::ProbeAdapter;
use ctxwatch_types::{Alert, AlertCategory, RecoveryAction, RecoveryActionKind, RecoveryOutcome, Severity};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::alerts::AGGREGATE_TARGET;
use crate::config::{ActionExpressions, RecoveryConfig};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};

/// Maps alerts to a recovery action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub min_severity: Severity,
    pub category: AlertCategory,
    pub action: RecoveryActionKind,
}

impl RecoveryPolicy {
    pub fn new(min_severity: Severity, category: AlertCategory, action: RecoveryActionKind) -> Self {
        Self {
            min_severity,
            category,
            action,
        }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        alert.category == self.category && alert.severity >= self.min_severity
    }
}

/// Performs a recovery action against a context.
#[async_trait]
pub trait RecoveryHandler: Send + Sync + fmt::Debug {
    async fn execute(&self, action: RecoveryActionKind, context_id: &str) -> anyhow::Result<()>;
}

/// Runs actions by evaluating a configured expression in the target context.
///
/// An expression that evaluates to `false` counts as a failed action.
#[derive(Debug, Clone)]
pub struct BridgeRecoveryHandler {
    adapter: ProbeAdapter,
    expressions: ActionExpressions,
    timeout: Duration,
}

impl BridgeRecoveryHandler {
    pub fn new(adapter: ProbeAdapter, expressions: ActionExpressions, timeout: Duration) -> Self {
        Self {
            adapter,
            expressions,
            timeout,
        }
    }
}

#[async_trait]
impl RecoveryHandler for BridgeRecoveryHandler {
    async fn execute(&self, action: RecoveryActionKind, context_id: &str) -> anyhow::Result<()> {
        let expression = self.expressions.for_action(action);
        let value = self.adapter.execute(context_id, expression, self.timeout).await?;
        if value == Value::Bool(false) {
            anyhow::bail!("{action} reported failure");
        }
        Ok(())
    }
}

/// Dispatches recovery actions and records their outcomes.
#[derive(Debug)]
pub struct RecoveryExecutor {
    enabled: bool,
    policies: Vec<RecoveryPolicy>,
    suppression_window_ms: u64,
    action_timeout: Duration,
    max_history: usize,
    handler: Arc<dyn RecoveryHandler>,
    bus: EventBus,
    last_dispatch: Mutex<HashMap<(RecoveryActionKind, String), u64>>,
    history: Arc<Mutex<VecDeque<RecoveryAction>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl RecoveryExecutor {
    pub fn new(config: &RecoveryConfig, handler: Arc<dyn RecoveryHandler>, bus: EventBus) -> Self {
        Self {
            enabled: config.enabled,
            policies: config.policies.clone(),
            suppression_window_ms: config.suppression_window_ms,
            action_timeout: config.action_timeout(),
            max_history: config.max_history,
            handler,
            bus,
            last_dispatch: Mutex::new(HashMap::new()),
            history: Arc::new(Mutex::new(VecDeque::new())),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// The action the first matching policy picks for `alert`.
    pub fn select(&self, alert: &Alert) -> Option<RecoveryActionKind> {
        self.policies.iter().find(|p| p.matches(alert)).map(|p| p.action)
    }

    /// Dispatch the recovery action for a newly active alert, if any.
    ///
    /// Must be called from within a tokio runtime. Returns the action that
    /// was started.
    pub fn dispatch(&self, alert: &Alert, now_ms: u64) -> Option<RecoveryActionKind> {
        if !self.enabled || alert.target == AGGREGATE_TARGET {
            return None;
        }
        let kind = self.select(alert)?;

        {
            let mut last = self.last_dispatch.lock();
            let key = (kind, alert.target.clone());
            if let Some(previous) = last.get(&key) {
                if now_ms < previous.saturating_add(self.suppression_window_ms) {
                    debug!(action = %kind, target = %alert.target, "recovery suppressed");
                    return None;
                }
            }
            last.insert(key, now_ms);
        }

        info!(action = %kind, target = %alert.target, alert = %alert.id, "dispatching recovery");

        let handler = self.handler.clone();
        let history = self.history.clone();
        let bus = self.bus.clone();
        let timeout = self.action_timeout;
        let max_history = self.max_history;
        let target = alert.target.clone();
        let alert_id = alert.id.clone();

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, handler.execute(kind, &target)).await {
                Ok(Ok(())) => RecoveryOutcome::Success,
                Ok(Err(e)) => RecoveryOutcome::Failure(format!("{e:#}")),
                Err(_) => RecoveryOutcome::Failure(format!("timed out after {}ms", timeout.as_millis())),
            };
            let action = RecoveryAction {
                kind,
                target,
                alert_id,
                outcome,
                timestamp_ms: now_ms,
                duration_ms: started.elapsed().as_millis() as u64,
            };

            {
                let mut history = history.lock();
                history.push_back(action.clone());
                while history.len() > max_history {
                    history.pop_front();
                }
            }

            match &action.outcome {
                RecoveryOutcome::Success => {
                    info!(action = %action.kind, target = %action.target, "recovery succeeded");
                    bus.publish(EngineEvent::RecoveryCompleted(action));
                }
                RecoveryOutcome::Failure(reason) => {
                    let err = EngineError::RecoveryActionFailure {
                        action: action.kind.to_string(),
                        target: action.target.clone(),
                        reason: reason.clone(),
                    };
                    error!(alert = %action.alert_id, error = %err, "recovery failed");
                    bus.publish(EngineEvent::RecoveryFailed(action));
                }
            }
        });
        Some(kind)
    }

    /// Recent outcomes, oldest first.
    pub fn history(&self) -> Vec<RecoveryAction> {
        self.history.lock().iter().cloned().collect()
    }

    /// Actions dispatched but not yet reaped.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Wait for every outstanding action to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "recovery task panicked");
            }
        }
    }
}
