//! Alert lifecycle.
//!
//! Each (rule, target) pair owns one slot. A slot holds at most one live
//! alert plus the counters that drive it through
//! `Pending -> Active -> AutoResolved` and back:
//!
//! ```text
//!   true x trigger_after        false x resolve_after
//! ──────────────────────> Active ──────────────────────> AutoResolved
//!                          │  ▲                              │
//!             acknowledge  │  │ true before cooldown expires │
//!                          ▼  └──────────────────────────────┘
//!                     Acknowledged
//! ```
//!
//! A true evaluation after the cooldown has passed creates a new alert.

use std::collections::{HashMap, VecDeque};

use ctxwatch_types::{Alert, AlertState, Severity};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::rule::{evaluate, AlertRule, EvaluationInput};
use crate::config::AlertsConfig;
use crate::error::{EngineError, Result};
use crate::state::Published;

/// A state change produced by one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    /// A new alert became active. Recovery may run for it.
    Activated(Alert),
    /// An open alert's condition held again.
    Retriggered(Alert),
    /// A closed alert fired again inside its cooldown and was reopened.
    Reopened(Alert),
    AutoResolved(Alert),
}

impl AlertTransition {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertTransition::Activated(a)
            | AlertTransition::Retriggered(a)
            | AlertTransition::Reopened(a)
            | AlertTransition::AutoResolved(a) => a,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<Alert>,
    /// Consecutive true evaluations while no alert is live.
    pending: u32,
    /// Consecutive false evaluations while the alert is open.
    false_streak: u32,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<(String, String), Slot>,
    closed: VecDeque<Alert>,
    next_id: u64,
}

/// Evaluates rules against published samples and tracks alert state.
#[derive(Debug)]
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    resolve_after: u32,
    max_closed: usize,
    inner: Mutex<Inner>,
    active: Published<Vec<Alert>>,
}

impl AlertEngine {
    pub fn new(config: &AlertsConfig) -> Self {
        Self {
            rules: config.rules.clone(),
            resolve_after: config.resolve_after_cycles.max(1),
            max_closed: config.max_closed,
            inner: Mutex::new(Inner::default()),
            active: Published::default(),
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Run every enabled rule once against `input`.
    ///
    /// A rule whose evaluation fails for any target is skipped entirely for
    /// this pass; its slots keep their previous state.
    pub fn evaluate(&self, input: &EvaluationInput<'_>, now_ms: u64) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();
        let mut inner = self.inner.lock();

        'rules: for rule in self.rules.iter().filter(|r| r.enabled) {
            let targets = rule.targets(input.sample);
            let mut verdicts = Vec::with_capacity(targets.len());
            for target in targets {
                match evaluate(&rule.condition, &target, input) {
                    Ok(verdict) => verdicts.push((target, verdict)),
                    Err(e) => {
                        warn!(rule = %rule.id, target = %target, error = %e, "skipping rule this cycle");
                        continue 'rules;
                    }
                }
            }

            for (target, verdict) in verdicts {
                let transition = if verdict {
                    let value = first_metric_value(rule, &target, input);
                    inner.on_true(rule, target, value, now_ms)
                } else {
                    inner.on_false(rule, target, self.resolve_after, now_ms)
                };
                if let Some(t) = transition {
                    transitions.push(t);
                }
            }
        }

        for t in &transitions {
            if let AlertTransition::AutoResolved(alert) = t {
                inner.push_closed(alert.clone(), self.max_closed);
            }
        }
        self.publish(&inner);
        transitions
    }

    /// Open alerts, most severe first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.load().as_ref().clone()
    }

    /// Shared handle to the published open-alert list.
    pub fn published(&self) -> std::sync::Arc<Vec<Alert>> {
        self.active.load()
    }

    /// Alerts closed recently, oldest first.
    pub fn recently_closed(&self) -> Vec<Alert> {
        self.inner.lock().closed.iter().cloned().collect()
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        let inner = self.inner.lock();
        inner
            .find(alert_id)
            .cloned()
            .or_else(|| inner.closed.iter().rev().find(|a| a.id == alert_id).cloned())
    }

    /// Operator acknowledgement.
    ///
    /// An active alert becomes acknowledged. An auto-resolved alert is
    /// closed for good (resolved).
    pub fn acknowledge(&self, alert_id: &str, now_ms: u64) -> Result<Alert> {
        let mut inner = self.inner.lock();
        let alert = inner.find_mut(alert_id)?;
        match alert.state {
            AlertState::Active | AlertState::Pending => alert.state = AlertState::Acknowledged,
            AlertState::AutoResolved => {
                alert.state = AlertState::Resolved;
                alert.resolved_at_ms.get_or_insert(now_ms);
            }
            AlertState::Acknowledged | AlertState::Resolved => {}
        }
        let alert = alert.clone();
        info!(alert = %alert.id, state = ?alert.state, "alert acknowledged");
        inner.replace_closed(&alert);
        self.publish(&inner);
        Ok(alert)
    }

    /// Operator resolution. Closes the alert regardless of its state.
    pub fn resolve(&self, alert_id: &str, now_ms: u64) -> Result<Alert> {
        let mut inner = self.inner.lock();
        let alert = inner.find_mut(alert_id)?;
        let was_open = alert.state.is_open();
        alert.state = AlertState::Resolved;
        alert.resolved_at_ms.get_or_insert(now_ms);
        let alert = alert.clone();
        info!(alert = %alert.id, "alert resolved");
        if was_open {
            inner.push_closed(alert.clone(), self.max_closed);
        } else {
            inner.replace_closed(&alert);
        }
        self.publish(&inner);
        Ok(alert)
    }

    /// Raise an alert's severity one tier after a failed recovery.
    pub fn escalate(&self, alert_id: &str) -> Result<Severity> {
        let mut inner = self.inner.lock();
        let alert = inner.find_mut(alert_id)?;
        let before = alert.severity;
        let after = alert.escalate();
        if after != before {
            warn!(alert = %alert_id, from = %before, to = %after, "alert escalated");
        }
        self.publish(&inner);
        Ok(after)
    }

    fn publish(&self, inner: &Inner) {
        let mut open: Vec<Alert> = inner
            .slots
            .values()
            .filter_map(|s| s.current.as_ref())
            .filter(|a| a.state.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.first_triggered_ms.cmp(&b.first_triggered_ms))
                .then_with(|| a.id.cmp(&b.id))
        });
        self.active.store(open);
    }
}

impl Inner {
    fn on_true(
        &mut self,
        rule: &AlertRule,
        target: String,
        value: Option<f64>,
        now_ms: u64,
    ) -> Option<AlertTransition> {
        let key = (rule.id.clone(), target);
        let slot = self.slots.entry(key.clone()).or_default();
        slot.false_streak = 0;

        if let Some(alert) = slot.current.as_mut() {
            if alert.state.is_open() {
                alert.last_triggered_ms = now_ms;
                alert.trigger_count += 1;
                debug!(alert = %alert.id, count = alert.trigger_count, "alert retriggered");
                return Some(AlertTransition::Retriggered(alert.clone()));
            }
            if now_ms < alert.last_triggered_ms.saturating_add(rule.cooldown_ms) {
                alert.state = AlertState::Active;
                alert.resolved_at_ms = None;
                alert.last_triggered_ms = now_ms;
                alert.trigger_count += 1;
                alert.message = rule.render_message(&key.1, value);
                self.closed.retain(|a| a.id != alert.id);
                info!(alert = %alert.id, "alert reopened within cooldown");
                return Some(AlertTransition::Reopened(alert.clone()));
            }
        }

        slot.pending += 1;
        if slot.pending < rule.trigger_after.max(1) {
            debug!(rule = %rule.id, target = %key.1, pending = slot.pending, "alert pending");
            return None;
        }
        slot.pending = 0;

        self.next_id += 1;
        let alert = Alert {
            id: format!("{}:{}:{}", rule.id, key.1, self.next_id),
            rule_id: rule.id.clone(),
            target: key.1.clone(),
            severity: rule.severity,
            category: rule.category,
            message: rule.render_message(&key.1, value),
            state: AlertState::Active,
            first_triggered_ms: now_ms,
            last_triggered_ms: now_ms,
            trigger_count: 1,
            resolved_at_ms: None,
            escalations: 0,
        };
        info!(alert = %alert.id, severity = %alert.severity, "{}", alert.message);
        let slot = self.slots.entry(key).or_default();
        slot.current = Some(alert.clone());
        Some(AlertTransition::Activated(alert))
    }

    fn on_false(
        &mut self,
        rule: &AlertRule,
        target: String,
        resolve_after: u32,
        now_ms: u64,
    ) -> Option<AlertTransition> {
        let key = (rule.id.clone(), target);
        let slot = self.slots.get_mut(&key)?;
        slot.pending = 0;

        let Some(alert) = slot.current.as_mut() else {
            self.slots.remove(&key);
            return None;
        };
        if !alert.state.is_open() {
            return None;
        }

        slot.false_streak += 1;
        if slot.false_streak < resolve_after {
            return None;
        }
        slot.false_streak = 0;
        alert.state = AlertState::AutoResolved;
        alert.resolved_at_ms = Some(now_ms);
        info!(alert = %alert.id, "alert auto-resolved");
        Some(AlertTransition::AutoResolved(alert.clone()))
    }

    fn find(&self, alert_id: &str) -> Option<&Alert> {
        self.slots
            .values()
            .filter_map(|s| s.current.as_ref())
            .find(|a| a.id == alert_id)
    }

    fn find_mut(&mut self, alert_id: &str) -> Result<&mut Alert> {
        self.slots
            .values_mut()
            .filter_map(|s| s.current.as_mut())
            .find(|a| a.id == alert_id)
            .ok_or_else(|| EngineError::UnknownAlert(alert_id.to_string()))
    }

    fn push_closed(&mut self, alert: Alert, max: usize) {
        self.closed.retain(|a| a.id != alert.id);
        self.closed.push_back(alert);
        while self.closed.len() > max {
            self.closed.pop_front();
        }
    }

    fn replace_closed(&mut self, alert: &Alert) {
        if let Some(entry) = self.closed.iter_mut().find(|a| a.id == alert.id) {
            *entry = alert.clone();
        }
    }
}

/// Value of the first metric a rule reads, for message rendering.
fn first_metric_value(rule: &AlertRule, target: &str, input: &EvaluationInput<'_>) -> Option<f64> {
    use super::rule::RuleCondition;

    let mut condition = &rule.condition;
    loop {
        match condition {
            RuleCondition::Threshold { metric, .. } | RuleCondition::Trend { metric, .. } => {
                return input.current(target, *metric)
            }
            RuleCondition::Pattern { .. } => return None,
            RuleCondition::Composite { conditions, .. } => condition = conditions.first()?,
        }
    }
}
