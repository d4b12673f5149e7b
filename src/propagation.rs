//! Cross-context error propagation.
//!
//! Error events are grouped into chains. Events sharing a correlation id
//! always join the same open chain. Uncorrelated events join an open
//! uncorrelated chain when they fall inside the causal window and touch a
//! context the chain already reached, or one linked to it by a known route.
//! A chain with no new event for the quiet period is finalized.

use std::collections::VecDeque;
use std::sync::Arc;

use ctxwatch_types::{ErrorEvent, PropagationChain};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::PropagationConfig;
use crate::state::Published;

#[derive(Debug, Default)]
struct Inner {
    open: Vec<PropagationChain>,
    finalized: VecDeque<PropagationChain>,
}

/// Reconstructs error chains from observed error events.
#[derive(Debug)]
pub struct PropagationTracker {
    config: PropagationConfig,
    inner: Mutex<Inner>,
    published: Published<Vec<PropagationChain>>,
}

impl PropagationTracker {
    pub fn new(config: PropagationConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            published: Published::default(),
        }
    }

    /// Add an event to its chain, starting a new one if nothing fits.
    ///
    /// `connected(a, b)` reports whether a route exists between two contexts
    /// in either direction. Returns the chain finalized early when the new
    /// chain pushed the open count past its limit.
    pub fn record<F>(&self, event: ErrorEvent, connected: F) -> Option<PropagationChain>
    where
        F: Fn(&str, &str) -> bool,
    {
        let mut inner = self.inner.lock();
        let window = self.config.causal_window_ms;

        let slot = match &event.correlation_id {
            Some(corr) => inner
                .open
                .iter()
                .position(|c| c.correlation_id.as_deref() == Some(corr.as_str())),
            None => inner
                .open
                .iter()
                .enumerate()
                .filter(|(_, c)| c.correlation_id.is_none())
                .filter(|(_, c)| within_window(c, event.timestamp_ms, window))
                .filter(|(_, c)| {
                    c.contexts
                        .iter()
                        .any(|ctx| *ctx == event.context_id || connected(ctx, &event.context_id))
                })
                .max_by_key(|(_, c)| c.last_seen_ms)
                .map(|(i, _)| i),
        };

        let mut evicted = None;
        match slot {
            Some(i) => {
                let chain = &mut inner.open[i];
                if chain.events.iter().any(|e| e.id == event.id) {
                    return None;
                }
                debug!(chain = %chain.origin_error_id, context = %event.context_id, "error joined chain");
                insert_ordered(chain, event);
            }
            None => {
                debug!(error = %event.id, context = %event.context_id, "new error chain");
                inner.open.push(PropagationChain::start(event));
                if inner.open.len() > self.config.max_open_chains.max(1) {
                    // Too many live chains: close the one quiet the longest.
                    if let Some(oldest) = inner
                        .open
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, c)| c.last_seen_ms)
                        .map(|(i, _)| i)
                    {
                        let chain = inner.open.remove(oldest);
                        evicted = Some(self.finalize(&mut inner, chain));
                    }
                }
            }
        }
        self.publish(&inner);
        evicted
    }

    /// Finalize chains that have been quiet for the configured period.
    ///
    /// Returns the chains finalized by this call.
    pub fn finalize_quiet(&self, now_ms: u64) -> Vec<PropagationChain> {
        let mut inner = self.inner.lock();
        let quiet = self.config.quiet_period_ms;

        let (done, still_open): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.open)
            .into_iter()
            .partition(|c| now_ms.saturating_sub(c.last_seen_ms) >= quiet);
        inner.open = still_open;

        let mut finalized = Vec::with_capacity(done.len());
        for chain in done {
            finalized.push(self.finalize(&mut inner, chain));
        }
        if !finalized.is_empty() {
            self.publish(&inner);
        }
        finalized
    }

    fn finalize(&self, inner: &mut Inner, mut chain: PropagationChain) -> PropagationChain {
        chain.finalized = true;
        if chain.handled {
            debug!(chain = %chain.origin_error_id, contexts = chain.len(), "error chain handled");
        } else {
            warn!(
                chain = %chain.origin_error_id,
                path = %chain.contexts.join(" -> "),
                "error chain went quiet without being handled"
            );
        }
        inner.finalized.push_back(chain.clone());
        while inner.finalized.len() > self.config.max_finalized {
            inner.finalized.pop_front();
        }
        chain
    }

    /// Finalized chains nobody handled, within retention.
    pub fn unhandled_count(&self) -> u64 {
        self.inner
            .lock()
            .finalized
            .iter()
            .filter(|c| !c.handled)
            .count() as u64
    }

    /// Unhandled chains finalized recently enough to still count as live.
    ///
    /// A chain counts until one quiet period has passed since it was
    /// finalized, so rules over this number can resolve again.
    pub fn recent_unhandled(&self, now_ms: u64) -> u64 {
        let horizon = self.config.quiet_period_ms.saturating_mul(2);
        self.inner
            .lock()
            .finalized
            .iter()
            .filter(|c| !c.handled && now_ms.saturating_sub(c.last_seen_ms) < horizon)
            .count() as u64
    }

    pub fn open_chains(&self) -> Vec<PropagationChain> {
        self.inner.lock().open.clone()
    }

    /// Retained finalized chains, oldest first.
    pub fn finalized_chains(&self) -> Vec<PropagationChain> {
        self.inner.lock().finalized.iter().cloned().collect()
    }

    /// Finalized and open chains ordered by first sighting.
    pub fn chains(&self) -> Arc<Vec<PropagationChain>> {
        self.published.load()
    }

    fn publish(&self, inner: &Inner) {
        let mut all: Vec<PropagationChain> = inner
            .finalized
            .iter()
            .chain(inner.open.iter())
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.first_seen_ms
                .cmp(&b.first_seen_ms)
                .then_with(|| a.origin_error_id.cmp(&b.origin_error_id))
        });
        self.published.store(all);
    }
}

fn within_window(chain: &PropagationChain, ts: u64, window: u64) -> bool {
    ts.saturating_add(window) >= chain.first_seen_ms && ts <= chain.last_seen_ms.saturating_add(window)
}

/// Insert keeping events in timestamp order, then rebuild the derived fields.
fn insert_ordered(chain: &mut PropagationChain, event: ErrorEvent) {
    let at = chain
        .events
        .partition_point(|e| e.timestamp_ms <= event.timestamp_ms);
    chain.events.insert(at, event);

    chain.contexts.clear();
    for e in &chain.events {
        if chain.contexts.last() != Some(&e.context_id) {
            chain.contexts.push(e.context_id.clone());
        }
    }
    chain.handled = chain.events.iter().any(|e| e.handled);
    if let (Some(first), Some(last)) = (chain.events.first(), chain.events.last()) {
        chain.origin_error_id = first.id.clone();
        chain.first_seen_ms = first.timestamp_ms;
        chain.last_seen_ms = last.timestamp_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PropagationTracker {
        PropagationTracker::new(PropagationConfig::default())
    }

    fn never(_: &str, _: &str) -> bool {
        false
    }

    #[test]
    fn correlated_errors_form_one_handled_chain() {
        let t = tracker();
        t.record(
            ErrorEvent::new("e1", "offscreen", "fetch failed", 1_000).with_correlation("X"),
            never,
        );
        t.record(
            ErrorEvent::new("e2", "service-worker", "retrying", 1_050)
                .with_correlation("X")
                .handled(),
            never,
        );

        let finalized = t.finalize_quiet(1_050 + 5_000);
        assert_eq!(finalized.len(), 1);
        let chain = &finalized[0];
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.contexts, vec!["offscreen", "service-worker"]);
        assert!(chain.handled);
        assert!(chain.finalized);
        assert_eq!(t.unhandled_count(), 0);
    }

    #[test]
    fn out_of_order_events_are_sorted() {
        let t = tracker();
        t.record(ErrorEvent::new("late", "b", "x", 2_000).with_correlation("c"), never);
        t.record(ErrorEvent::new("early", "a", "x", 1_000).with_correlation("c"), never);

        let chain = &t.open_chains()[0];
        assert_eq!(chain.origin_error_id, "early");
        assert_eq!(chain.contexts, vec!["a", "b"]);
        assert_eq!(chain.first_seen_ms, 1_000);
        assert_eq!(chain.last_seen_ms, 2_000);
    }

    #[test]
    fn consecutive_repeats_collapse() {
        let t = tracker();
        for (i, ctx) in ["a", "a", "b", "b", "a"].iter().enumerate() {
            t.record(
                ErrorEvent::new(format!("e{i}"), *ctx, "x", i as u64).with_correlation("c"),
                never,
            );
        }
        assert_eq!(t.open_chains()[0].contexts, vec!["a", "b", "a"]);
    }

    #[test]
    fn uncorrelated_errors_join_via_known_route() {
        let t = tracker();
        let linked = |a: &str, b: &str| (a == "cs" && b == "sw") || (a == "sw" && b == "cs");

        t.record(ErrorEvent::new("e1", "cs", "boom", 1_000), linked);
        t.record(ErrorEvent::new("e2", "sw", "boom", 1_500), linked);
        // outside the causal window
        t.record(ErrorEvent::new("e3", "sw", "boom", 9_000), linked);
        // unrelated context
        t.record(ErrorEvent::new("e4", "popup", "boom", 9_100), linked);

        let chains = t.open_chains();
        assert_eq!(chains.len(), 3);
        assert_eq!(chains[0].contexts, vec!["cs", "sw"]);
    }

    #[test]
    fn unhandled_chains_are_counted_after_quiet_period() {
        let t = tracker();
        t.record(ErrorEvent::new("e1", "a", "x", 1_000), never);

        assert!(t.finalize_quiet(5_999).is_empty());
        assert_eq!(t.unhandled_count(), 0);

        assert_eq!(t.finalize_quiet(6_000).len(), 1);
        assert_eq!(t.unhandled_count(), 1);
        assert!(t.open_chains().is_empty());

        assert_eq!(t.recent_unhandled(6_000), 1);
        assert_eq!(t.recent_unhandled(11_000), 0);
        assert_eq!(t.unhandled_count(), 1);
    }

    #[test]
    fn duplicate_events_are_ignored() {
        let t = tracker();
        let e = ErrorEvent::new("e1", "a", "x", 1).with_correlation("c");
        t.record(e.clone(), never);
        t.record(e, never);
        assert_eq!(t.open_chains()[0].events.len(), 1);
    }

    #[test]
    fn retention_is_bounded() {
        let config = PropagationConfig {
            max_finalized: 2,
            max_open_chains: 2,
            ..PropagationConfig::default()
        };
        let t = PropagationTracker::new(config);
        let mut evicted = Vec::new();
        for i in 0..5u64 {
            evicted.extend(t.record(
                ErrorEvent::new(format!("e{i}"), "a", "x", i).with_correlation(format!("c{i}")),
                never,
            ));
        }
        let origins: Vec<&str> = evicted.iter().map(|c| c.origin_error_id.as_str()).collect();
        assert_eq!(origins, vec!["e0", "e1", "e2"]);
        assert!(evicted.iter().all(|c| c.finalized && !c.handled));
        assert_eq!(t.open_chains().len(), 2);
        assert_eq!(t.finalized_chains().len(), 2);
        assert_eq!(t.chains().len(), 4);
    }
}
