//! Engine configuration.
//!
//! Every section has working defaults, so an empty file (or no file at all)
//! yields a usable engine. Files are loaded with the `config` crate and can
//! be overridden from the environment, e.g.
//! `CTXWATCH_SAMPLING__INTERVAL_MS=500`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use ctxwatch_types::{AlertCategory, MetricPath, RecoveryActionKind, Severity};
use serde::{Deserialize, Serialize};

use crate::alerts::{AlertRule, Comparator, RuleTarget};
use crate::error::{EngineError, Result};
use crate::recovery::RecoveryPolicy;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sampling: SamplingConfig,
    pub health: HealthConfig,
    pub alerts: AlertsConfig,
    pub recovery: RecoveryConfig,
    pub flow: FlowConfig,
    pub propagation: PropagationConfig,
    pub bottleneck: BottleneckConfig,
    pub dashboard: DashboardConfig,
}

impl EngineConfig {
    /// Load configuration from a file, with `CTXWATCH_*` environment overrides.
    ///
    /// Nested keys use a double underscore: `CTXWATCH_ALERTS__RESOLVE_AFTER_CYCLES=5`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("CTXWATCH").separator("__"))
            .build()?;

        let config: EngineConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the engine's guarantees.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        if self.sampling.interval_ms == 0 {
            return invalid("sampling.interval_ms must be positive".into());
        }
        if self.sampling.probe_timeout_ms == 0 {
            return invalid("sampling.probe_timeout_ms must be positive".into());
        }
        if self.sampling.discovery_timeout_ms == 0 {
            return invalid("sampling.discovery_timeout_ms must be positive".into());
        }
        if self.sampling.inactive_after_failures == 0 {
            return invalid("sampling.inactive_after_failures must be at least 1".into());
        }
        self.health.validate()?;

        if self.recovery.action_timeout_ms == 0 {
            return invalid("recovery.action_timeout_ms must be positive".into());
        }
        if self.alerts.resolve_after_cycles == 0 {
            return invalid("alerts.resolve_after_cycles must be at least 1".into());
        }
        // An alert only stays Active while its condition held within the last
        // cooldown, so auto-resolution must fit inside it.
        let resolve_span = u64::from(self.alerts.resolve_after_cycles) * self.sampling.interval_ms;
        let mut seen = std::collections::HashSet::new();
        for rule in &self.alerts.rules {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return invalid(format!("duplicate alert rule id '{}'", rule.id));
            }
            if rule.cooldown_ms < resolve_span {
                return invalid(format!(
                    "rule '{}' cooldown {}ms is shorter than resolve_after_cycles x interval ({}ms)",
                    rule.id, rule.cooldown_ms, resolve_span
                ));
            }
        }

        if !(self.flow.latency_alpha > 0.0 && self.flow.latency_alpha <= 1.0) {
            return invalid("flow.latency_alpha must be in (0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.flow.failure_threshold) {
            return invalid("flow.failure_threshold must be in [0, 1]".into());
        }
        if self.propagation.quiet_period_ms == 0 {
            return invalid("propagation.quiet_period_ms must be positive".into());
        }
        if self.bottleneck.interval_ms == 0 {
            return invalid("bottleneck.interval_ms must be positive".into());
        }
        if self.bottleneck.trailing_window == 0 || self.bottleneck.baseline_window == 0 {
            return invalid("bottleneck windows must be positive".into());
        }
        if self.bottleneck.deviation_multiple <= 1.0 {
            return invalid("bottleneck.deviation_multiple must exceed 1.0".into());
        }
        if self.bottleneck.sustained_passes == 0 {
            return invalid("bottleneck.sustained_passes must be at least 1".into());
        }
        if self.dashboard.interval_ms == 0 {
            return invalid("dashboard.interval_ms must be positive".into());
        }
        if self.dashboard.history_size == 0 {
            return invalid("dashboard.history_size must be positive".into());
        }
        Ok(())
    }

    /// Samples to retain: enough for the bottleneck windows and every rule window.
    pub fn history_capacity(&self) -> usize {
        let rule_window = self
            .alerts
            .rules
            .iter()
            .map(|r| r.condition.window())
            .max()
            .unwrap_or(1);
        self.sampling
            .history_size
            .max(self.bottleneck.baseline_window + self.bottleneck.trailing_window)
            .max(rule_window)
    }
}

/// Sampling loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
    /// Deadline for one context's probe, retries included.
    pub probe_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    /// Consecutive failed probes before a context is marked inactive.
    pub inactive_after_failures: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Overrides the built-in metrics expression.
    pub metrics_expression: Option<String>,
    pub capture_structure: bool,
    /// Samples kept for export and analysis.
    pub history_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            probe_timeout_ms: 250,
            discovery_timeout_ms: 500,
            inactive_after_failures: 3,
            max_retries: 2,
            retry_backoff_ms: 25,
            metrics_expression: None,
            capture_structure: false,
            history_size: 900,
        }
    }
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

/// Weights and ceilings of the health score.
///
/// Each signal is normalized as `1 - value / ceiling`, clipped to `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub memory_weight: f64,
    pub response_weight: f64,
    pub error_weight: f64,
    pub memory_ceiling_mb: f64,
    pub response_ceiling_ms: f64,
    pub error_ceiling: f64,
    /// Minimum score for a context to count as healthy.
    pub healthy_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_weight: 0.3,
            response_weight: 0.4,
            error_weight: 0.3,
            memory_ceiling_mb: 512.0,
            response_ceiling_ms: 2_000.0,
            error_ceiling: 10.0,
            healthy_threshold: 0.5,
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<()> {
        let weights = [self.memory_weight, self.response_weight, self.error_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "health weights must be non-negative with a positive sum".into(),
            ));
        }
        let ceilings = [self.memory_ceiling_mb, self.response_ceiling_ms, self.error_ceiling];
        if ceilings.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return Err(EngineError::InvalidConfig("health ceilings must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.healthy_threshold) {
            return Err(EngineError::InvalidConfig(
                "health.healthy_threshold must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Alert rule set and state machine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub rules: Vec<AlertRule>,
    /// Consecutive false evaluations before an open alert auto-resolves.
    pub resolve_after_cycles: u32,
    /// Closed alerts kept for the dashboard.
    pub max_closed: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            resolve_after_cycles: 3,
            max_closed: 100,
        }
    }
}

/// Rules active when none are configured.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::threshold("high-memory", MetricPath::MemoryUsage, Comparator::Gt, 256.0)
            .with_message("{target} is using {value}MB of heap"),
        AlertRule::threshold("slow-response", MetricPath::ResponseTime, Comparator::Gt, 2_000.0)
            .with_message("{target} answered in {value}ms"),
        AlertRule::threshold("console-errors", MetricPath::ErrorCount, Comparator::Gte, 5.0)
            .with_severity(Severity::Error),
        AlertRule::threshold("unhealthy-context", MetricPath::HealthScore, Comparator::Lt, 0.3)
            .with_severity(Severity::Error)
            .with_trigger_after(2),
        AlertRule::threshold("broken-routes", MetricPath::FlaggedRoutes, Comparator::Gt, 0.0)
            .with_target(RuleTarget::Aggregate),
        AlertRule::threshold("unhandled-errors", MetricPath::UnhandledChains, Comparator::Gt, 0.0)
            .with_target(RuleTarget::Aggregate)
            .with_severity(Severity::Error),
    ]
}

/// Automatic recovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Minimum gap between two runs of the same action on the same context.
    pub suppression_window_ms: u64,
    pub action_timeout_ms: u64,
    /// Ordered policy list; the first match wins.
    pub policies: Vec<RecoveryPolicy>,
    pub expressions: ActionExpressions,
    /// Recovery outcomes kept for the dashboard.
    pub max_history: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppression_window_ms: 30_000,
            action_timeout_ms: 2_000,
            policies: vec![
                RecoveryPolicy::new(
                    Severity::Critical,
                    AlertCategory::Availability,
                    RecoveryActionKind::RestartContext,
                ),
                RecoveryPolicy::new(
                    Severity::Error,
                    AlertCategory::Memory,
                    RecoveryActionKind::ForceGarbageCollection,
                ),
                RecoveryPolicy::new(
                    Severity::Warning,
                    AlertCategory::Memory,
                    RecoveryActionKind::ClearCache,
                ),
            ],
            expressions: ActionExpressions::default(),
            max_history: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Expressions the default handler evaluates for each action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionExpressions {
    pub clear_cache: String,
    pub force_gc: String,
    pub restart_context: String,
}

impl Default for ActionExpressions {
    fn default() -> Self {
        Self {
            clear_cache: "(async () => { if (typeof caches === 'undefined') return false; \
                for (const k of await caches.keys()) await caches.delete(k); return true; })()"
                .to_string(),
            force_gc: "(() => { if (typeof gc !== 'function') return false; gc(); return true; })()"
                .to_string(),
            restart_context: "(() => { if (typeof chrome !== 'undefined' && chrome.runtime?.reload) \
                { chrome.runtime.reload(); return true; } location.reload(); return true; })()"
                .to_string(),
        }
    }
}

impl ActionExpressions {
    pub fn for_action(&self, kind: RecoveryActionKind) -> &str {
        match kind {
            RecoveryActionKind::ClearCache => &self.clear_cache,
            RecoveryActionKind::ForceGarbageCollection => &self.force_gc,
            RecoveryActionKind::RestartContext => &self.restart_context,
        }
    }
}

/// Message flow tracking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Weight of the newest latency observation in the moving average.
    pub latency_alpha: f64,
    /// Messages a route needs before it can be flagged.
    pub min_messages: u64,
    /// Failure rate at or above which a route is flagged.
    pub failure_threshold: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            latency_alpha: 0.2,
            min_messages: 5,
            failure_threshold: 0.5,
        }
    }
}

/// Error propagation tracking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Window for grouping uncorrelated errors in connected contexts.
    pub causal_window_ms: u64,
    /// A chain with no new event for this long is finalized.
    pub quiet_period_ms: u64,
    pub max_open_chains: usize,
    pub max_finalized: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            causal_window_ms: 2_000,
            quiet_period_ms: 5_000,
            max_open_chains: 256,
            max_finalized: 200,
        }
    }
}

/// Bottleneck analysis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckConfig {
    pub interval_ms: u64,
    /// Most recent samples compared against the baseline.
    pub trailing_window: usize,
    /// Samples before the trailing window that form the baseline.
    pub baseline_window: usize,
    /// Baseline samples required before a context is analyzed at all.
    pub min_baseline_samples: usize,
    /// Ratio to baseline that counts as a deviation.
    pub deviation_multiple: f64,
    /// Consecutive deviating passes before a bottleneck is reported.
    pub sustained_passes: u32,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            trailing_window: 5,
            baseline_window: 600,
            min_baseline_samples: 10,
            deviation_multiple: 1.3,
            sustained_passes: 3,
        }
    }
}

impl BottleneckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Dashboard aggregation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub interval_ms: u64,
    /// Past snapshots kept in the ring.
    pub history_size: usize,
    pub recent_chains: usize,
    pub recent_recoveries: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            history_size: 120,
            recent_chains: 20,
            recent_recoveries: 20,
        }
    }
}

impl DashboardConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.probe_timeout(), Duration::from_millis(250));
        assert_eq!(config.history_capacity(), 900);
    }

    #[test]
    fn cooldown_shorter_than_resolution_is_rejected() {
        let mut config = EngineConfig::default();
        config.alerts.rules = vec![AlertRule::threshold(
            "slow",
            MetricPath::ResponseTime,
            Comparator::Gt,
            2_000.0,
        )
        .with_cooldown_ms(2_000)];

        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(err.to_string().contains("cooldown"));
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let mut config = EngineConfig::default();
        let rule = AlertRule::threshold("dup", MetricPath::ErrorCount, Comparator::Gt, 1.0);
        config.alerts.rules = vec![rule.clone(), rule];
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_periods_are_rejected() {
        let cases: [fn(&mut EngineConfig); 4] = [
            |c| c.bottleneck.interval_ms = 0,
            |c| c.dashboard.interval_ms = 0,
            |c| c.sampling.discovery_timeout_ms = 0,
            |c| c.recovery.action_timeout_ms = 0,
        ];
        for zero_out in cases {
            let mut config = EngineConfig::default();
            zero_out(&mut config);
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("must be positive"), "{err}");
        }
    }

    #[test]
    fn zero_weights_are_rejected() {
        let mut config = EngineConfig::default();
        config.health.memory_weight = 0.0;
        config.health.response_weight = 0.0;
        config.health.error_weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[sampling]
interval_ms = 500
probe_timeout_ms = 150

[alerts]
resolve_after_cycles = 2

[[alerts.rules]]
id = "slow-response"
category = "latency"
severity = "error"
cooldown_ms = 60000
condition = {{ kind = "threshold", metric = "response_time_ms", comparator = ">", limit = 2000.0 }}

[bottleneck]
deviation_multiple = 1.5
"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.sampling.interval_ms, 500);
        assert_eq!(config.sampling.probe_timeout_ms, 150);
        assert_eq!(config.sampling.inactive_after_failures, 3);
        assert_eq!(config.alerts.resolve_after_cycles, 2);
        assert_eq!(config.alerts.rules.len(), 1);
        assert_eq!(config.alerts.rules[0].severity, Severity::Error);
        assert_eq!(config.bottleneck.deviation_multiple, 1.5);
        assert_eq!(config.bottleneck.trailing_window, 5);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[flow]\nlatency_alpha = 0.0").unwrap();

        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn action_expressions_by_kind() {
        let exprs = ActionExpressions::default();
        assert!(exprs.for_action(RecoveryActionKind::ForceGarbageCollection).contains("gc()"));
    }
}
