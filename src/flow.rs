//! Message flow tracking between contexts.

use std::collections::BTreeMap;

use ctxwatch_types::{MessageEvent, Route};
use tracing::debug;

use crate::config::FlowConfig;
use crate::state::Published;

/// Route table keyed by (source, target).
pub type RouteTable = BTreeMap<(String, String), Route>;

/// A route whose failure rate crossed the flagging threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedRoute {
    pub route: Route,
    /// The reverse direction exists and is healthy.
    pub one_directional: bool,
}

/// Maintains per-route statistics from observed messages.
#[derive(Debug)]
pub struct FlowTracker {
    config: FlowConfig,
    routes: Published<RouteTable>,
}

impl FlowTracker {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            routes: Published::default(),
        }
    }

    /// Fold one message into its route.
    pub fn record(&self, event: &MessageEvent) {
        let alpha = self.config.latency_alpha.clamp(0.0, 1.0);
        let latency = if event.latency_ms.is_finite() {
            event.latency_ms.max(0.0)
        } else {
            0.0
        };

        self.routes.update(|routes| {
            let route = routes
                .entry((event.source.clone(), event.target.clone()))
                .or_insert_with(|| Route::new(&event.source, &event.target));

            route.average_latency_ms = if route.total_messages == 0 {
                latency
            } else {
                alpha * latency + (1.0 - alpha) * route.average_latency_ms
            };
            route.total_messages += 1;
            if event.success {
                route.successful_messages += 1;
            } else {
                route.failed_messages += 1;
            }
            route.last_message_ms = route.last_message_ms.max(event.timestamp_ms);
        });
        debug!(source = %event.source, target = %event.target, success = event.success, "message recorded");
    }

    pub fn route(&self, source: &str, target: &str) -> Option<Route> {
        self.routes
            .load()
            .get(&(source.to_string(), target.to_string()))
            .cloned()
    }

    /// All routes, ordered by (source, target).
    pub fn routes(&self) -> Vec<Route> {
        self.routes.load().values().cloned().collect()
    }

    /// Whether any message was seen between `a` and `b`, in either direction.
    pub fn connected(&self, a: &str, b: &str) -> bool {
        let routes = self.routes.load();
        routes.contains_key(&(a.to_string(), b.to_string()))
            || routes.contains_key(&(b.to_string(), a.to_string()))
    }

    fn is_flagged(&self, route: &Route) -> bool {
        route.total_messages >= self.config.min_messages
            && route.failure_rate() >= self.config.failure_threshold
    }

    /// Routes failing at or above the threshold with enough traffic to judge.
    pub fn flagged_routes(&self) -> Vec<FlaggedRoute> {
        let routes = self.routes.load();
        routes
            .values()
            .filter(|r| self.is_flagged(r))
            .map(|route| {
                let reverse = routes.get(&(route.target.clone(), route.source.clone()));
                FlaggedRoute {
                    one_directional: reverse.is_some_and(|r| !self.is_flagged(r)),
                    route: route.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FlowTracker {
        FlowTracker::new(FlowConfig::default())
    }

    fn msg(source: &str, target: &str, latency: f64, success: bool, ts: u64) -> MessageEvent {
        MessageEvent::new(source, target, latency, success, ts)
    }

    #[test]
    fn first_message_sets_average() {
        let flow = tracker();
        flow.record(&msg("cs", "sw", 40.0, true, 1));
        let route = flow.route("cs", "sw").unwrap();
        assert_eq!(route.average_latency_ms, 40.0);
        assert_eq!(route.total_messages, 1);
    }

    #[test]
    fn latency_is_exponentially_smoothed() {
        let flow = tracker();
        flow.record(&msg("cs", "sw", 100.0, true, 1));
        flow.record(&msg("cs", "sw", 200.0, true, 2));
        // 0.2 * 200 + 0.8 * 100
        let route = flow.route("cs", "sw").unwrap();
        assert!((route.average_latency_ms - 120.0).abs() < 1e-9);
        assert_eq!(route.last_message_ms, 2);
    }

    #[test]
    fn broken_route_is_flagged() {
        let flow = tracker();
        for i in 0..10 {
            flow.record(&msg("content-script", "service-worker", 5.0, i < 2, i));
        }
        let route = flow.route("content-script", "service-worker").unwrap();
        assert!((route.success_rate() - 0.2).abs() < 1e-9);
        assert!(route.is_consistent());

        let flagged = flow.flagged_routes();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].route.source, "content-script");
        assert!(!flagged[0].one_directional);
    }

    #[test]
    fn healthy_reverse_marks_one_directional() {
        let flow = tracker();
        for i in 0..6 {
            flow.record(&msg("a", "b", 1.0, false, i));
            flow.record(&msg("b", "a", 1.0, true, i));
        }
        let flagged = flow.flagged_routes();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].one_directional);
    }

    #[test]
    fn low_traffic_is_not_flagged() {
        let flow = tracker();
        for i in 0..4 {
            flow.record(&msg("a", "b", 1.0, false, i));
        }
        assert!(flow.flagged_routes().is_empty());
    }

    #[test]
    fn totals_stay_consistent() {
        let flow = tracker();
        for i in 0..50u64 {
            flow.record(&msg("a", "b", i as f64, i % 3 != 0, i));
            flow.record(&msg("b", "c", f64::NAN, i % 5 == 0, i));
        }
        for route in flow.routes() {
            assert!(route.is_consistent());
            assert!(route.average_latency_ms.is_finite());
        }
        assert!(flow.connected("c", "b"));
        assert!(!flow.connected("a", "c"));
    }
}
