//! Alerts and their lifecycle states.

use std::fmt;

/// Alert severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// One tier up. Critical stays Critical.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Info => Severity::Warning,
            Severity::Warning => Severity::Error,
            Severity::Error | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an alert is about. Used to pick recovery actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AlertCategory {
    Memory,
    Latency,
    Errors,
    Availability,
    Flow,
    Propagation,
    Performance,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Memory => "memory",
            AlertCategory::Latency => "latency",
            AlertCategory::Errors => "errors",
            AlertCategory::Availability => "availability",
            AlertCategory::Flow => "flow",
            AlertCategory::Propagation => "propagation",
            AlertCategory::Performance => "performance",
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AlertState {
    /// Condition is true but hasn't held long enough to fire.
    Pending,
    Active,
    /// An operator has seen it; the condition may still be true.
    Acknowledged,
    /// The condition cleared for enough consecutive cycles.
    AutoResolved,
    /// Closed by an operator.
    Resolved,
}

impl AlertState {
    /// Active or acknowledged - the alert still demands attention.
    pub fn is_open(&self) -> bool {
        matches!(self, AlertState::Active | AlertState::Acknowledged)
    }

    /// Auto-resolved or resolved.
    pub fn is_closed(&self) -> bool {
        matches!(self, AlertState::AutoResolved | AlertState::Resolved)
    }
}

/// One alert instance for a (rule, target) pair.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    /// Context id, or `aggregate` for sample-wide rules.
    pub target: String,
    pub severity: Severity,
    pub category: AlertCategory,
    pub message: String,
    pub state: AlertState,
    pub first_triggered_ms: u64,
    pub last_triggered_ms: u64,
    /// Evaluations that found the condition true while this alert was live.
    pub trigger_count: u32,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub resolved_at_ms: Option<u64>,
    /// Times the severity was raised after a failed recovery.
    pub escalations: u32,
}

impl Alert {
    /// Raise severity one tier, returning the new severity.
    pub fn escalate(&mut self) -> Severity {
        let next = self.severity.escalate();
        if next != self.severity {
            self.severity = next;
            self.escalations += 1;
        }
        self.severity
    }

    /// Milliseconds the alert has been live as of `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.first_triggered_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(severity: Severity) -> Alert {
        Alert {
            id: "a-1".into(),
            rule_id: "slow".into(),
            target: "svc".into(),
            severity,
            category: AlertCategory::Latency,
            message: "slow".into(),
            state: AlertState::Active,
            first_triggered_ms: 1_000,
            last_triggered_ms: 1_000,
            trigger_count: 1,
            resolved_at_ms: None,
            escalations: 0,
        }
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn escalate_raises_one_tier() {
        let mut a = alert(Severity::Warning);
        assert_eq!(a.escalate(), Severity::Error);
        assert_eq!(a.escalations, 1);
    }

    #[test]
    fn escalate_caps_at_critical() {
        let mut a = alert(Severity::Critical);
        assert_eq!(a.escalate(), Severity::Critical);
        assert_eq!(a.escalations, 0);
    }

    #[test]
    fn open_and_closed_states() {
        assert!(AlertState::Active.is_open());
        assert!(AlertState::Acknowledged.is_open());
        assert!(!AlertState::Pending.is_open());
        assert!(AlertState::AutoResolved.is_closed());
        assert!(AlertState::Resolved.is_closed());
    }
}
