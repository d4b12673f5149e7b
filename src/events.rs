//! Internal event bus.
//!
//! Producers (the sampling cycle, the recovery executor, callers reporting
//! observed traffic) publish here after the trackers have been updated. The
//! engine's pump escalates failed recoveries; external subscribers see the
//! same stream.

use std::sync::Arc;

use ctxwatch_types::{Alert, ErrorEvent, MessageEvent, MetricsSample, PropagationChain, RecoveryAction};
use tokio::sync::broadcast;

/// Default bus capacity. Slow subscribers lag rather than block producers.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Something that happened inside the engine or was reported to it.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A message between two contexts was observed.
    MessageObserved(MessageEvent),
    /// An error was observed in a context.
    ErrorObserved(ErrorEvent),
    SampleCollected(Arc<MetricsSample>),
    /// A context was marked inactive after repeated probe failures.
    ContextInactive { context_id: String },
    ContextReactivated { context_id: String },
    AlertRaised(Alert),
    AlertResolved(Alert),
    /// An error chain went quiet without any context handling it.
    UnhandledChain(PropagationChain),
    RecoveryCompleted(RecoveryAction),
    /// A recovery action failed; its alert is escalated.
    RecoveryFailed(RecoveryAction),
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::MessageObserved(_) => "message_observed",
            EngineEvent::ErrorObserved(_) => "error_observed",
            EngineEvent::SampleCollected(_) => "sample_collected",
            EngineEvent::ContextInactive { .. } => "context_inactive",
            EngineEvent::ContextReactivated { .. } => "context_reactivated",
            EngineEvent::AlertRaised(_) => "alert_raised",
            EngineEvent::AlertResolved(_) => "alert_resolved",
            EngineEvent::UnhandledChain(_) => "unhandled_chain",
            EngineEvent::RecoveryCompleted(_) => "recovery_completed",
            EngineEvent::RecoveryFailed(_) => "recovery_failed",
        }
    }
}

/// Broadcast bus for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let delivered = bus.publish(EngineEvent::ContextInactive {
            context_id: "ui".into(),
        });
        assert_eq!(delivered, 1);

        match rx.recv().await.unwrap() {
            EngineEvent::ContextInactive { context_id } => assert_eq!(context_id, "ui"),
            other => panic!("unexpected event {}", other.kind()),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.publish(EngineEvent::MessageObserved(MessageEvent::new("a", "b", 1.0, true, 0))),
            0
        );
    }
}
