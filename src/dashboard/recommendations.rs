//! Operator recommendations derived from published state.

use ctxwatch_types::{AlertCategory, BottleneckKind, Recommendation, Severity};

use super::DashboardSources;

/// Derive recommendations, most urgent first.
pub fn derive(sources: &DashboardSources) -> Vec<Recommendation> {
    let mut out = Vec::new();

    for flagged in &sources.flagged_routes {
        let route = &flagged.route;
        let mut message = format!(
            "{:.0}% of {} messages from {} to {} failed; check the listener in {}",
            route.failure_rate() * 100.0,
            route.total_messages,
            route.source,
            route.target,
            route.target
        );
        if flagged.one_directional {
            message.push_str(" (the reverse direction is healthy)");
        }
        out.push(Recommendation {
            priority: Severity::Error,
            category: AlertCategory::Flow,
            subject: format!("{} -> {}", route.source, route.target),
            message,
        });
    }

    for chain in sources.chains.iter().filter(|c| c.finalized && !c.handled) {
        let origin = chain.origin_context().unwrap_or("unknown");
        let last = chain.last_context().unwrap_or(origin);
        let message = if chain.crosses_contexts() {
            format!(
                "Error from {origin} propagated through {} and was never handled; add handling in {last}",
                chain.contexts.join(" -> ")
            )
        } else {
            format!("Error in {origin} was never handled")
        };
        out.push(Recommendation {
            priority: Severity::Warning,
            category: AlertCategory::Propagation,
            subject: origin.to_string(),
            message,
        });
    }

    for b in sources.bottlenecks.iter() {
        let (category, advice) = match b.kind {
            BottleneckKind::Memory => (AlertCategory::Memory, "look for retained objects or unbounded caches"),
            BottleneckKind::Cpu => (AlertCategory::Performance, "profile long-running tasks"),
            BottleneckKind::Latency => (AlertCategory::Latency, "check for blocking work on the event loop"),
            BottleneckKind::Throughput => (AlertCategory::Performance, "check for stalled request queues"),
        };
        out.push(Recommendation {
            priority: b.severity,
            category,
            subject: b.context_id.clone(),
            message: format!(
                "{} {} is {:.0}% above baseline; {advice}",
                b.context_id, b.kind, b.estimated_slowdown_pct
            ),
        });
    }

    for ctx in sources.contexts.values().filter(|c| !c.is_active) {
        out.push(Recommendation {
            priority: Severity::Error,
            category: AlertCategory::Availability,
            subject: ctx.id.clone(),
            message: format!(
                "{} ({}) stopped answering after {} failed probes",
                ctx.id, ctx.role, ctx.consecutive_failures
            ),
        });
    }

    if let Some(sample) = &sources.sample {
        for (id, metrics) in sample.iter().filter(|(_, m)| !m.is_healthy) {
            let inactive = sources.contexts.get(id).is_some_and(|c| !c.is_active);
            if inactive {
                continue;
            }
            let detail = metrics
                .issues
                .first()
                .map(|i| format!(": {i}"))
                .unwrap_or_default();
            out.push(Recommendation {
                priority: Severity::Warning,
                category: AlertCategory::Availability,
                subject: id.clone(),
                message: format!("{id} is unhealthy (score {:.2}){detail}", metrics.health_score),
            });
        }
    }

    for alert in sources.alerts.iter().filter(|a| a.severity == Severity::Critical) {
        out.push(Recommendation {
            priority: Severity::Critical,
            category: alert.category,
            subject: alert.target.clone(),
            message: format!("Critical alert {}: {}", alert.rule_id, alert.message),
        });
    }

    out.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.subject.cmp(&b.subject))
            .then_with(|| a.message.cmp(&b.message))
    });
    out
}
