//! Error events and the chains they form across contexts.

/// An error observed in one context.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorEvent {
    pub id: String,
    pub context_id: String,
    /// Shared id carried across message boundaries, when the app attaches one.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub correlation_id: Option<String>,
    pub message: String,
    /// The context caught or recovered from this error itself.
    pub handled: bool,
    pub timestamp_ms: u64,
}

impl ErrorEvent {
    pub fn new(
        id: impl Into<String>,
        context_id: impl Into<String>,
        message: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            context_id: context_id.into(),
            correlation_id: None,
            message: message.into(),
            handled: false,
            timestamp_ms,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn handled(mut self) -> Self {
        self.handled = true;
        self
    }
}

/// The reconstructed path of an error across contexts.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PropagationChain {
    /// Id of the earliest event in the chain.
    pub origin_error_id: String,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub correlation_id: Option<String>,
    /// Contexts in the order the error reached them. Consecutive repeats are collapsed.
    pub contexts: Vec<String>,
    /// Member events ordered by timestamp.
    pub events: Vec<ErrorEvent>,
    pub handled: bool,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    /// No further correlated event arrived within the quiet period.
    pub finalized: bool,
}

impl PropagationChain {
    /// Start a chain from its first event.
    pub fn start(event: ErrorEvent) -> Self {
        Self {
            origin_error_id: event.id.clone(),
            correlation_id: event.correlation_id.clone(),
            contexts: vec![event.context_id.clone()],
            handled: event.handled,
            first_seen_ms: event.timestamp_ms,
            last_seen_ms: event.timestamp_ms,
            events: vec![event],
            finalized: false,
        }
    }

    /// Number of contexts the error traversed.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Context where the error was first seen.
    pub fn origin_context(&self) -> Option<&str> {
        self.contexts.first().map(String::as_str)
    }

    /// Most recent context the error reached.
    pub fn last_context(&self) -> Option<&str> {
        self.contexts.last().map(String::as_str)
    }

    /// Whether the chain touches more than one context.
    pub fn crosses_contexts(&self) -> bool {
        self.contexts.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_starts_from_event() {
        let event = ErrorEvent::new("e1", "offscreen", "boom", 100).with_correlation("X");
        let chain = PropagationChain::start(event);

        assert_eq!(chain.origin_error_id, "e1");
        assert_eq!(chain.correlation_id.as_deref(), Some("X"));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.origin_context(), Some("offscreen"));
        assert!(!chain.handled);
        assert!(!chain.crosses_contexts());
    }

    #[test]
    fn handled_event_starts_handled_chain() {
        let chain = PropagationChain::start(ErrorEvent::new("e1", "ui", "x", 1).handled());
        assert!(chain.handled);
    }
}
