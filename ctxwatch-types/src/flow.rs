//! Directed message flow between contexts.

/// An observed message from one context to another.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageEvent {
    pub source: String,
    pub target: String,
    /// Delivery latency as measured by the observer.
    pub latency_ms: f64,
    pub success: bool,
    pub timestamp_ms: u64,
    /// Message type label, if the observer knows it.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub kind: Option<String>,
}

impl MessageEvent {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        latency_ms: f64,
        success: bool,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            latency_ms,
            success,
            timestamp_ms,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Cumulative statistics for a directed (source, target) pair.
///
/// `successful_messages + failed_messages == total_messages` always holds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Route {
    pub source: String,
    pub target: String,
    pub total_messages: u64,
    pub successful_messages: u64,
    pub failed_messages: u64,
    pub average_latency_ms: f64,
    pub last_message_ms: u64,
}

impl Route {
    /// Create an empty route.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            total_messages: 0,
            successful_messages: 0,
            failed_messages: 0,
            average_latency_ms: 0.0,
            last_message_ms: 0,
        }
    }

    /// Fraction of messages delivered successfully. 1.0 for an unused route.
    pub fn success_rate(&self) -> f64 {
        if self.total_messages == 0 {
            return 1.0;
        }
        self.successful_messages as f64 / self.total_messages as f64
    }

    pub fn failure_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    /// Whether `successful + failed == total`.
    pub fn is_consistent(&self) -> bool {
        self.successful_messages + self.failed_messages == self.total_messages
    }
}
