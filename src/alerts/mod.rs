//! Alerting: rule definitions and the per-(rule, target) state machine.

mod engine;
mod rule;

pub use engine::{AlertEngine, AlertTransition};
pub use rule::{
    evaluate, AlertRule, Comparator, EvaluationInput, LogicalOperator, RuleCondition, RuleTarget,
    TrackerMetrics, TrendDirection, AGGREGATE_TARGET, DEFAULT_COOLDOWN_MS,
};
