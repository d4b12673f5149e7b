//! Timeout-bounded probes of a single execution context.
//!
//! A probe selects the context, evaluates the metrics expression (its round
//! trip is the context's response time), then drains console and network
//! activity concurrently. Whatever happens, the caller gets a [`ProbeResult`]
//! back within the timeout it passed in.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ctxwatch_adapters::{InstrumentationBridge, ProbeAdapter, ProbeResult};
//!
//! async fn probe(bridge: Arc<dyn InstrumentationBridge>) {
//!     let adapter = ProbeAdapter::builder(bridge).max_retries(1).build();
//!
//!     match adapter.sample("sw-1", Duration::from_millis(250)).await {
//!         ProbeResult::Success(data) => println!("rtt {:.1}ms", data.response_time_ms),
//!         ProbeResult::Partial(data, reason) => println!("partial ({reason}): {:?}", data.memory_usage_mb),
//!         ProbeResult::Failure(failure) => println!("probe failed: {failure}"),
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ctxwatch_types::ProbeStatus;
use futures_util::future;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::bridge::{
    ConsoleEntry, ContextDescriptor, InstrumentationBridge, NetworkEntry, StructuralSnapshot,
};
use crate::BridgeError;

/// Expression evaluated in each context to read its metrics.
///
/// Returns `{ memory_bytes }`, or `null` where the heap isn't exposed.
pub const DEFAULT_METRICS_EXPRESSION: &str = "(() => { \
    const m = (typeof performance !== 'undefined' && performance.memory) || null; \
    return m ? { memory_bytes: m.usedJSHeapSize } : null; \
})()";

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default delay before the first retry. Doubles on each subsequent retry.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(25);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Everything a probe managed to read from a context.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeData {
    /// Round trip of the metrics evaluation.
    pub response_time_ms: f64,
    pub memory_usage_mb: Option<f64>,
    pub console: Vec<ConsoleEntry>,
    pub network: Vec<NetworkEntry>,
    pub structure: Option<StructuralSnapshot>,
}

impl ProbeData {
    /// Console entries logged at error level.
    pub fn error_entries(&self) -> impl Iterator<Item = &ConsoleEntry> {
        self.console.iter().filter(|e| e.is_error())
    }

    pub fn error_count(&self) -> u64 {
        self.error_entries().count() as u64
    }

    /// Mean duration of the network requests that reported one.
    pub fn network_latency_ms(&self) -> Option<f64> {
        let durations: Vec<f64> = self.network.iter().filter_map(|n| n.duration_ms).collect();
        if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        }
    }

    pub fn failed_requests(&self) -> u64 {
        self.network.iter().filter(|n| n.is_failure()).count() as u64
    }
}

/// Why a probe produced nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeFailureKind {
    Timeout,
    Unavailable,
    ContextGone,
    InvalidMetric,
}

impl ProbeFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeFailureKind::Timeout => "timeout",
            ProbeFailureKind::Unavailable => "unavailable",
            ProbeFailureKind::ContextGone => "context gone",
            ProbeFailureKind::InvalidMetric => "invalid metric",
        }
    }
}

/// A failed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub kind: ProbeFailureKind,
    pub reason: String,
}

impl ProbeFailure {
    pub fn new(kind: ProbeFailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self::new(
            ProbeFailureKind::Timeout,
            format!("probe timed out after {}ms", timeout.as_millis()),
        )
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.reason)
    }
}

impl std::error::Error for ProbeFailure {}

impl From<BridgeError> for ProbeFailure {
    fn from(err: BridgeError) -> Self {
        let kind = match &err {
            BridgeError::Timeout => ProbeFailureKind::Timeout,
            BridgeError::Unavailable(_) => ProbeFailureKind::Unavailable,
            BridgeError::ContextGone(_) => ProbeFailureKind::ContextGone,
            BridgeError::Protocol(_) | BridgeError::Script(_) => ProbeFailureKind::InvalidMetric,
        };
        Self::new(kind, err.to_string())
    }
}

/// Outcome of probing one context.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// Every signal was read.
    Success(ProbeData),
    /// Some signals were read; the reason names what's missing.
    Partial(ProbeData, String),
    Failure(ProbeFailure),
}

impl ProbeResult {
    pub fn data(&self) -> Option<&ProbeData> {
        match self {
            ProbeResult::Success(data) | ProbeResult::Partial(data, _) => Some(data),
            ProbeResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ProbeFailure> {
        match self {
            ProbeResult::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success(_))
    }

    pub fn status(&self) -> ProbeStatus {
        match self {
            ProbeResult::Success(_) => ProbeStatus::Success,
            ProbeResult::Partial(..) => ProbeStatus::Partial,
            ProbeResult::Failure(_) => ProbeStatus::Failure,
        }
    }
}

/// Probes contexts through an [`InstrumentationBridge`].
#[derive(Debug, Clone)]
pub struct ProbeAdapter {
    bridge: Arc<dyn InstrumentationBridge>,
    max_retries: u32,
    backoff: Duration,
    metrics_expression: String,
    capture_structure: bool,
}

impl ProbeAdapter {
    /// Create a new builder for configuring the adapter.
    pub fn builder(bridge: Arc<dyn InstrumentationBridge>) -> ProbeAdapterBuilder {
        ProbeAdapterBuilder::new(bridge)
    }

    pub fn bridge(&self) -> &Arc<dyn InstrumentationBridge> {
        &self.bridge
    }

    /// Probe one context. The whole call, retries included, is bounded by `timeout`.
    pub async fn sample(&self, context_id: &str, timeout: Duration) -> ProbeResult {
        match tokio::time::timeout(timeout, self.sample_with_retry(context_id)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(context = context_id, "probe deadline elapsed");
                ProbeResult::Failure(ProbeFailure::timed_out(timeout))
            }
        }
    }

    /// List the contexts the bridge currently knows about.
    ///
    /// Retries and deadline behave as for [`ProbeAdapter::sample`].
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<ContextDescriptor>, ProbeFailure> {
        let listing = self.with_retry("discover", || self.bridge.list_contexts());
        match tokio::time::timeout(timeout, listing).await {
            Ok(result) => result.map_err(ProbeFailure::from),
            Err(_) => Err(ProbeFailure::timed_out(timeout)),
        }
    }

    /// Evaluate an arbitrary expression in a context, once.
    ///
    /// Used for corrective actions, which must not be repeated blindly.
    pub async fn execute(
        &self,
        context_id: &str,
        expression: &str,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let call = async {
            self.bridge.select_context(context_id).await?;
            self.bridge.evaluate_in_context(context_id, expression).await
        };
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(BridgeError::Timeout))
    }

    async fn sample_with_retry(&self, context_id: &str) -> ProbeResult {
        match self.with_retry(context_id, || self.attempt(context_id)).await {
            Ok(result) => result,
            Err(err) => ProbeResult::Failure(err.into()),
        }
    }

    async fn with_retry<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BridgeError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt));
                    debug!(target_id = label, attempt, error = %err, "retrying bridge call");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, context_id: &str) -> Result<ProbeResult, BridgeError> {
        self.bridge.select_context(context_id).await?;

        let mut missing = Vec::new();
        let mut data = ProbeData::default();

        let started = Instant::now();
        let evaluated = self
            .bridge
            .evaluate_in_context(context_id, &self.metrics_expression)
            .await;
        data.response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        match evaluated {
            Ok(value) => match parse_memory(&value) {
                Ok(Some(mb)) => data.memory_usage_mb = Some(mb),
                Ok(None) => missing.push("memory not reported".to_string()),
                Err(reason) => missing.push(reason),
            },
            Err(BridgeError::Script(msg)) => missing.push(format!("metrics script failed: {msg}")),
            Err(err) => return Err(err),
        }

        let (console, network) = future::join(
            self.bridge.read_console_output(context_id),
            self.bridge.read_network_activity(context_id),
        )
        .await;

        match console {
            Ok(entries) => data.console = entries,
            Err(err @ BridgeError::ContextGone(_)) => return Err(err),
            Err(err) => missing.push(format!("console unavailable: {err}")),
        }
        match network {
            Ok(entries) => data.network = entries,
            Err(err @ BridgeError::ContextGone(_)) => return Err(err),
            Err(err) => missing.push(format!("network unavailable: {err}")),
        }

        if self.capture_structure {
            match self.bridge.take_structural_snapshot(context_id).await {
                Ok(snapshot) => data.structure = Some(snapshot),
                Err(err) => missing.push(format!("snapshot unavailable: {err}")),
            }
        }

        if missing.is_empty() {
            Ok(ProbeResult::Success(data))
        } else {
            Ok(ProbeResult::Partial(data, missing.join("; ")))
        }
    }
}

/// Read heap usage out of the metrics expression's result.
///
/// Accepts a bare byte count, or an object carrying `memory_bytes`,
/// `usedJSHeapSize` or `memory_mb`. `null` means the context doesn't expose
/// it; anything else is malformed.
fn parse_memory(value: &Value) -> Result<Option<f64>, String> {
    let invalid = || format!("invalid metric: {value}");
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .filter(|b| b.is_finite() && *b >= 0.0)
            .map(|b| Some(b / BYTES_PER_MB))
            .ok_or_else(invalid),
        Value::Object(map) => {
            for (key, scale) in [
                ("memory_bytes", BYTES_PER_MB),
                ("usedJSHeapSize", BYTES_PER_MB),
                ("memory_mb", 1.0),
            ] {
                if let Some(field) = map.get(key) {
                    return match field {
                        Value::Null => Ok(None),
                        Value::Number(n) => n
                            .as_f64()
                            .filter(|v| v.is_finite() && *v >= 0.0)
                            .map(|v| Some(v / scale))
                            .ok_or_else(invalid),
                        _ => Err(invalid()),
                    };
                }
            }
            Ok(None)
        }
        _ => Err(invalid()),
    }
}

/// Builder for `ProbeAdapter`.
#[derive(Debug)]
pub struct ProbeAdapterBuilder {
    bridge: Arc<dyn InstrumentationBridge>,
    max_retries: Option<u32>,
    backoff: Option<Duration>,
    metrics_expression: Option<String>,
    capture_structure: bool,
}

impl ProbeAdapterBuilder {
    fn new(bridge: Arc<dyn InstrumentationBridge>) -> Self {
        Self {
            bridge,
            max_retries: None,
            backoff: None,
            metrics_expression: None,
            capture_structure: false,
        }
    }

    /// Set how many times a transient failure is retried (default: 2).
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the delay before the first retry (default: 25ms).
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Override the expression used to read context metrics.
    pub fn metrics_expression(mut self, expression: impl Into<String>) -> Self {
        self.metrics_expression = Some(expression.into());
        self
    }

    /// Also capture a structural snapshot on every probe.
    pub fn capture_structure(mut self, capture: bool) -> Self {
        self.capture_structure = capture;
        self
    }

    /// Build the adapter.
    pub fn build(self) -> ProbeAdapter {
        ProbeAdapter {
            bridge: self.bridge,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            backoff: self.backoff.unwrap_or(DEFAULT_RETRY_BACKOFF),
            metrics_expression: self
                .metrics_expression
                .unwrap_or_else(|| DEFAULT_METRICS_EXPRESSION.to_string()),
            capture_structure: self.capture_structure,
        }
    }
}
