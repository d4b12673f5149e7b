//! The remote instrumentation bridge and the payloads it returns.
//!
//! The bridge is the external service that reaches into the application's
//! execution contexts. ctxwatch only depends on this trait; how the bridge
//! attaches to the application is its own business.

use std::fmt::Debug;

use async_trait::async_trait;
use ctxwatch_types::ContextRole;
use serde::{Deserialize, Serialize};

use crate::BridgeError;

/// A context as listed by the bridge, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDescriptor {
    pub id: String,
    /// Loosely-typed kind string, e.g. `service_worker` or `popup`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ContextDescriptor {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            url: None,
            title: None,
        }
    }

    /// Validate the kind string against the closed role set.
    pub fn role(&self) -> Option<ContextRole> {
        ContextRole::from_bridge_kind(&self.kind)
    }
}

/// Console message level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Debug,
    Log,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

/// Marker an application writes into a console message to tie it to a
/// correlation id, e.g. `fetch failed corr=req-42`.
pub const CORRELATION_TOKEN: &str = "corr=";

/// Marker for an error the context caught and recovered from.
pub const HANDLED_MARKER: &str = "[handled]";

/// One console message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub text: String,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl ConsoleEntry {
    pub fn new(level: ConsoleLevel, text: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            level,
            text: text.into(),
            timestamp_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == ConsoleLevel::Error
    }

    /// Correlation id embedded in the message, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        let start = self.text.find(CORRELATION_TOKEN)? + CORRELATION_TOKEN.len();
        let rest = &self.text[start..];
        let id = rest
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';' || c == ')' || c == ']')
            .next()?;
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    /// Whether the context marked this error as caught.
    pub fn is_handled(&self) -> bool {
        self.text.contains(HANDLED_MARKER)
    }
}

/// One completed (or failed) network request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl NetworkEntry {
    /// Failed at the transport level or answered with a 5xx.
    pub fn is_failure(&self) -> bool {
        self.failed || self.status.is_some_and(|s| s >= 500)
    }
}

/// Structural (DOM-like) snapshot of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralSnapshot {
    pub node_count: u64,
    #[serde(default)]
    pub captured_at_ms: u64,
    /// Raw tree as returned by the bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<serde_json::Value>,
}

/// Interface to the remote instrumentation bridge.
///
/// Every call names the context it targets, so implementations must accept
/// concurrent calls for different contexts. Console reads drain: each call
/// returns the messages logged since the previous read of that context.
///
/// Callers should not invoke these directly with no deadline; go through
/// [`crate::ProbeAdapter`], which bounds every call.
#[async_trait]
pub trait InstrumentationBridge: Send + Sync + Debug {
    /// List the contexts currently attached.
    async fn list_contexts(&self) -> Result<Vec<ContextDescriptor>, BridgeError>;

    /// Make a context the target of subsequent calls.
    async fn select_context(&self, context_id: &str) -> Result<(), BridgeError>;

    /// Evaluate an expression inside a context and return its JSON value.
    async fn evaluate_in_context(
        &self,
        context_id: &str,
        expression: &str,
    ) -> Result<serde_json::Value, BridgeError>;

    /// Console messages logged since the previous read.
    async fn read_console_output(&self, context_id: &str)
        -> Result<Vec<ConsoleEntry>, BridgeError>;

    /// Network requests completed since the previous read.
    async fn read_network_activity(
        &self,
        context_id: &str,
    ) -> Result<Vec<NetworkEntry>, BridgeError>;

    /// Capture the context's structural snapshot.
    async fn take_structural_snapshot(
        &self,
        context_id: &str,
    ) -> Result<StructuralSnapshot, BridgeError>;
}
