//! Error types for the engine.

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// None of these stop the engine. Probe errors degrade a single context,
/// rule errors skip a single rule for one cycle, and recovery failures
/// escalate the originating alert.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Probe of '{context}' timed out")]
    ProbeTimeout { context: String },

    #[error("Probe of '{context}' failed: {reason}")]
    ProbeUnavailable { context: String, reason: String },

    #[error("Invalid metric '{path}': {reason}")]
    InvalidMetric { path: String, reason: String },

    #[error("Rule '{rule}' could not be evaluated: {reason}")]
    RuleEvaluation { rule: String, reason: String },

    #[error("Recovery action {action} on '{target}' failed: {reason}")]
    RecoveryActionFailure {
        action: String,
        target: String,
        reason: String,
    },

    #[error("Unknown alert: {0}")]
    UnknownAlert(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    pub(crate) fn rule(rule: &str, reason: impl Into<String>) -> Self {
        EngineError::RuleEvaluation {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_metric(path: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidMetric {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
