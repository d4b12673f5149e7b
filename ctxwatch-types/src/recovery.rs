//! Recovery actions taken in response to alerts.

use std::fmt;

/// Corrective action the engine can take against a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RecoveryActionKind {
    ClearCache,
    ForceGarbageCollection,
    RestartContext,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionKind::ClearCache => "clear_cache",
            RecoveryActionKind::ForceGarbageCollection => "force_gc",
            RecoveryActionKind::RestartContext => "restart_context",
        }
    }
}

impl fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running a recovery action.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case", tag = "status", content = "reason"))]
pub enum RecoveryOutcome {
    Success,
    Failure(String),
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryOutcome::Success)
    }
}

/// A recovery action that ran (or failed to run) against a context.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecoveryAction {
    pub kind: RecoveryActionKind,
    /// Context the action ran against.
    pub target: String,
    /// Alert that triggered the action.
    pub alert_id: String,
    pub outcome: RecoveryOutcome,
    pub timestamp_ms: u64,
    pub duration_ms: u64,
}
