//! Alert rule definitions and condition evaluation.
//!
//! Rules are plain data, deserialized from configuration. Evaluation is a
//! pure function of one published sample, the recent sample window and the
//! tracker counters, so the same inputs always produce the same verdict.

use std::fmt;
use std::sync::Arc;

use ctxwatch_types::{AlertCategory, ContextRole, MetricPath, MetricScope, MetricsSample, Severity};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Target label used for rules scoped to the whole sample.
pub const AGGREGATE_TARGET: &str = "aggregate";

/// Default cooldown between distinct alerts for the same rule and target.
pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;

/// Comparison used by threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Comparator {
    pub fn apply(&self, value: f64, limit: f64) -> bool {
        match self {
            Comparator::Gt => value > limit,
            Comparator::Gte => value >= limit,
            Comparator::Lt => value < limit,
            Comparator::Lte => value <= limit,
            Comparator::Eq => (value - limit).abs() < f64::EPSILON,
            Comparator::Ne => (value - limit).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

/// What a rule checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// A scalar metric compared against a limit.
    Threshold {
        metric: MetricPath,
        comparator: Comparator,
        limit: f64,
    },
    /// Monotonic movement across the last `window` samples, by more than `min_delta` overall.
    Trend {
        metric: MetricPath,
        direction: TrendDirection,
        window: usize,
        min_delta: f64,
    },
    /// Issue substrings appearing in this order within the last `window` samples.
    Pattern { sequence: Vec<String>, window: usize },
    Composite {
        operator: LogicalOperator,
        conditions: Vec<RuleCondition>,
    },
}

impl RuleCondition {
    /// Number of samples this condition looks back over, including the current one.
    pub fn window(&self) -> usize {
        match self {
            RuleCondition::Threshold { .. } => 1,
            RuleCondition::Trend { window, .. } | RuleCondition::Pattern { window, .. } => *window,
            RuleCondition::Composite { conditions, .. } => {
                conditions.iter().map(RuleCondition::window).max().unwrap_or(1)
            }
        }
    }

    fn metrics(&self, out: &mut Vec<MetricPath>) {
        match self {
            RuleCondition::Threshold { metric, .. } | RuleCondition::Trend { metric, .. } => {
                out.push(*metric)
            }
            RuleCondition::Pattern { .. } => {}
            RuleCondition::Composite { conditions, .. } => {
                conditions.iter().for_each(|c| c.metrics(out))
            }
        }
    }

    fn validate(&self, rule: &str) -> Result<()> {
        match self {
            RuleCondition::Threshold { limit, .. } if !limit.is_finite() => {
                Err(EngineError::rule(rule, "threshold limit must be finite"))
            }
            RuleCondition::Trend { window, .. } if *window < 2 => {
                Err(EngineError::rule(rule, "trend window needs at least 2 samples"))
            }
            RuleCondition::Trend { metric, .. } if metric.scope() == MetricScope::Tracker => Err(
                EngineError::rule(rule, format!("'{metric}' has no history to trend over")),
            ),
            RuleCondition::Pattern { sequence, window } => {
                if sequence.is_empty() {
                    Err(EngineError::rule(rule, "pattern sequence is empty"))
                } else if *window == 0 {
                    Err(EngineError::rule(rule, "pattern window must be positive"))
                } else {
                    Ok(())
                }
            }
            RuleCondition::Composite { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(EngineError::rule(rule, "composite has no conditions"));
                }
                conditions.iter().try_for_each(|c| c.validate(rule))
            }
            _ => Ok(()),
        }
    }
}

/// Which part of the sample a rule is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    /// Every context in the sample, each with its own alert.
    #[default]
    AllContexts,
    Role(ContextRole),
    Context(String),
    /// The sample as a whole.
    Aggregate,
}

impl fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleTarget::AllContexts => f.write_str("all contexts"),
            RuleTarget::Role(role) => write!(f, "role {role}"),
            RuleTarget::Context(id) => write!(f, "context {id}"),
            RuleTarget::Aggregate => f.write_str(AGGREGATE_TARGET),
        }
    }
}

/// A configured alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub condition: RuleCondition,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default)]
    pub severity: Severity,
    pub category: AlertCategory,
    /// Minimum gap between two distinct alerts for the same target.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Consecutive true evaluations needed before an alert activates.
    #[serde(default = "default_trigger_after")]
    pub trigger_after: u32,
    /// Message template. `{target}` and `{value}` are substituted.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_trigger_after() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    /// Create an enabled rule with default cooldown and trigger count.
    pub fn new(
        id: impl Into<String>,
        condition: RuleCondition,
        severity: Severity,
        category: AlertCategory,
    ) -> Self {
        Self {
            id: id.into(),
            condition,
            target: RuleTarget::default(),
            severity,
            category,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            trigger_after: 1,
            message: None,
            enabled: true,
        }
    }

    pub fn threshold(
        id: impl Into<String>,
        metric: MetricPath,
        comparator: Comparator,
        limit: f64,
    ) -> Self {
        Self::new(
            id,
            RuleCondition::Threshold {
                metric,
                comparator,
                limit,
            },
            Severity::Warning,
            category_for(metric),
        )
    }

    pub fn with_target(mut self, target: RuleTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_category(mut self, category: AlertCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_cooldown_ms(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }

    pub fn with_trigger_after(mut self, cycles: u32) -> Self {
        self.trigger_after = cycles;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Check the rule is well-formed and its metrics fit its target.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidConfig("alert rule with empty id".into()));
        }
        if self.trigger_after == 0 {
            return Err(EngineError::rule(&self.id, "trigger_after must be at least 1"));
        }
        self.condition.validate(&self.id)?;

        let mut metrics = Vec::new();
        self.condition.metrics(&mut metrics);
        for metric in metrics {
            let fits = match metric.scope() {
                MetricScope::Context => true,
                MetricScope::Aggregate | MetricScope::Tracker => self.target == RuleTarget::Aggregate,
            };
            if !fits {
                return Err(EngineError::rule(
                    &self.id,
                    format!("'{metric}' can only be evaluated against the aggregate target"),
                ));
            }
        }
        Ok(())
    }

    /// Resolve the concrete targets this rule applies to in a sample.
    pub fn targets(&self, sample: &MetricsSample) -> Vec<String> {
        match &self.target {
            RuleTarget::AllContexts => sample.contexts.keys().cloned().collect(),
            RuleTarget::Role(role) => sample
                .iter()
                .filter(|(_, m)| m.role == *role)
                .map(|(id, _)| id.clone())
                .collect(),
            RuleTarget::Context(id) => {
                if sample.contexts.contains_key(id) {
                    vec![id.clone()]
                } else {
                    Vec::new()
                }
            }
            RuleTarget::Aggregate => vec![AGGREGATE_TARGET.to_string()],
        }
    }

    /// Render the alert message for a target.
    pub fn render_message(&self, target: &str, value: Option<f64>) -> String {
        let value = value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string());
        match &self.message {
            Some(template) => template.replace("{target}", target).replace("{value}", &value),
            None => match &self.condition {
                RuleCondition::Threshold {
                    metric,
                    comparator,
                    limit,
                } => format!("{target}: {metric} = {value} ({} {limit})", comparator.symbol()),
                RuleCondition::Trend {
                    metric, direction, ..
                } => {
                    let direction = match direction {
                        TrendDirection::Rising => "rising",
                        TrendDirection::Falling => "falling",
                    };
                    format!("{target}: {metric} {direction} trend (now {value})")
                }
                RuleCondition::Pattern { sequence, .. } => {
                    format!("{target}: issue pattern [{}] observed", sequence.join(" -> "))
                }
                RuleCondition::Composite { .. } => format!("{target}: rule '{}' matched", self.id),
            },
        }
    }
}

/// Default category for single-metric rules.
fn category_for(metric: MetricPath) -> AlertCategory {
    match metric {
        MetricPath::MemoryUsage => AlertCategory::Memory,
        MetricPath::ResponseTime | MetricPath::NetworkLatency => AlertCategory::Latency,
        MetricPath::ErrorCount => AlertCategory::Errors,
        MetricPath::HealthScore | MetricPath::NetworkRequests => AlertCategory::Availability,
        MetricPath::CpuUsage => AlertCategory::Performance,
        MetricPath::FlaggedRoutes => AlertCategory::Flow,
        MetricPath::UnhandledChains => AlertCategory::Propagation,
    }
}

/// Counters published by the flow and propagation trackers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackerMetrics {
    pub flagged_routes: u64,
    pub unhandled_chains: u64,
}

impl TrackerMetrics {
    pub fn get(&self, path: MetricPath) -> Option<f64> {
        match path {
            MetricPath::FlaggedRoutes => Some(self.flagged_routes as f64),
            MetricPath::UnhandledChains => Some(self.unhandled_chains as f64),
            _ => None,
        }
    }
}

/// Everything a rule may look at during one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub sample: &'a MetricsSample,
    /// Recent samples, oldest first, ending with `sample`.
    pub window: &'a [Arc<MetricsSample>],
    pub trackers: TrackerMetrics,
}

impl<'a> EvaluationInput<'a> {
    /// Resolve a metric for a target in a given sample.
    fn metric_in(&self, sample: &MetricsSample, target: &str, path: MetricPath) -> Option<f64> {
        if target == AGGREGATE_TARGET {
            match path.scope() {
                MetricScope::Tracker => self.trackers.get(path),
                _ => sample.aggregate_metric(path),
            }
        } else {
            sample.context_metric(target, path)
        }
    }

    /// Current value of a metric for a target.
    pub fn current(&self, target: &str, path: MetricPath) -> Option<f64> {
        self.metric_in(self.sample, target, path)
    }

    /// The last `n` samples of the window (fewer when history is short).
    fn recent(&self, n: usize) -> &'a [Arc<MetricsSample>] {
        let start = self.window.len().saturating_sub(n);
        &self.window[start..]
    }

    fn issues(&self, sample: &'a MetricsSample, target: &str) -> Vec<&'a str> {
        if target == AGGREGATE_TARGET {
            sample
                .contexts
                .values()
                .flat_map(|m| m.issues.iter().map(String::as_str))
                .collect()
        } else {
            sample
                .get(target)
                .map(|m| m.issues.iter().map(String::as_str).collect())
                .unwrap_or_default()
        }
    }
}

/// Evaluate a condition for one target.
///
/// Missing signals evaluate to `false`. Errors are reserved for conditions
/// that can't be evaluated at all.
pub fn evaluate(condition: &RuleCondition, target: &str, input: &EvaluationInput<'_>) -> Result<bool> {
    match condition {
        RuleCondition::Threshold {
            metric,
            comparator,
            limit,
        } => {
            check_scope(*metric, target)?;
            Ok(input
                .current(target, *metric)
                .is_some_and(|value| comparator.apply(value, *limit)))
        }
        RuleCondition::Trend {
            metric,
            direction,
            window,
            min_delta,
        } => {
            check_scope(*metric, target)?;
            if metric.scope() == MetricScope::Tracker {
                return Err(EngineError::invalid_metric(metric.as_str(), "no history for tracker metrics"));
            }
            let samples = input.recent(*window);
            if samples.len() < *window {
                return Ok(false);
            }
            let values: Option<Vec<f64>> = samples
                .iter()
                .map(|s| input.metric_in(s, target, *metric))
                .collect();
            let Some(values) = values else {
                return Ok(false);
            };
            Ok(is_monotonic(&values, *direction, *min_delta))
        }
        RuleCondition::Pattern { sequence, window } => {
            if sequence.is_empty() {
                return Err(EngineError::invalid_metric("pattern", "empty sequence"));
            }
            let issues: Vec<&str> = input
                .recent(*window)
                .iter()
                .flat_map(|s| input.issues(s, target))
                .collect();
            Ok(matches_in_order(&issues, sequence))
        }
        RuleCondition::Composite {
            operator,
            conditions,
        } => {
            if conditions.is_empty() {
                return Err(EngineError::invalid_metric("composite", "no child conditions"));
            }
            let mut results = Vec::with_capacity(conditions.len());
            for child in conditions {
                results.push(evaluate(child, target, input)?);
            }
            Ok(match operator {
                LogicalOperator::And => results.iter().all(|r| *r),
                LogicalOperator::Or => results.iter().any(|r| *r),
            })
        }
    }
}

fn check_scope(metric: MetricPath, target: &str) -> Result<()> {
    if metric.scope() != MetricScope::Context && target != AGGREGATE_TARGET {
        return Err(EngineError::invalid_metric(
            metric.as_str(),
            format!("not defined for context '{target}'"),
        ));
    }
    Ok(())
}

fn is_monotonic(values: &[f64], direction: TrendDirection, min_delta: f64) -> bool {
    let (Some(first), Some(last)) = (values.first(), values.last()) else {
        return false;
    };
    let steps_ok = values.windows(2).all(|w| match direction {
        TrendDirection::Rising => w[1] >= w[0],
        TrendDirection::Falling => w[1] <= w[0],
    });
    let change = match direction {
        TrendDirection::Rising => last - first,
        TrendDirection::Falling => first - last,
    };
    steps_ok && change > min_delta
}

/// Whether each needle appears, in order, as a substring of successive issues.
fn matches_in_order(issues: &[&str], sequence: &[String]) -> bool {
    let mut needles = sequence.iter().peekable();
    for issue in issues {
        match needles.peek() {
            Some(needle) if issue.contains(needle.as_str()) => {
                needles.next();
            }
            Some(_) => {}
            None => break,
        }
    }
    needles.peek().is_none()
}
