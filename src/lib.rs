//! # ctxwatch
//!
//! A telemetry and alerting engine for applications that run as several
//! cooperating execution contexts (a background worker, page scripts,
//! offscreen workers, UI surfaces) reachable through an instrumentation
//! bridge.
//!
//! The engine probes every context on a fixed cadence, scores its health,
//! evaluates alert rules over the resulting samples, runs recovery actions
//! for matching alerts, tracks message flow and error propagation between
//! contexts, and publishes consolidated dashboard snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          TelemetryEngine                         │
//! │                                                                  │
//! │  ┌───────────┐   ┌───────────┐   ┌──────────┐   ┌────────────┐  │
//! │  │ collector │──▶│  history  │──▶│  alerts  │──▶│  recovery  │  │
//! │  │ (probes)  │   │  (ring)   │   │ (rules)  │   │ (actions)  │  │
//! │  └─────┬─────┘   └─────┬─────┘   └────┬─────┘   └─────┬──────┘  │
//! │        │               ▼              │               │         │
//! │        │        ┌────────────┐        │               │         │
//! │        │        │ bottleneck │        │               │         │
//! │        │        └────────────┘        │               │         │
//! │        ▼                              ▼               ▼         │
//! │  ┌──────────────────── EventBus (broadcast) ─────────────────┐  │
//! │  └──────┬──────────────────────┬─────────────────────────────┘  │
//! │         ▼                      ▼                                │
//! │    ┌─────────┐          ┌─────────────┐       ┌─────────────┐   │
//! │    │  flow   │          │ propagation │──────▶│  dashboard  │   │
//! │    └─────────┘          └─────────────┘       └─────────────┘   │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  ▼
//!                     InstrumentationBridge (adapters)
//! ```
//!
//! - **[`collector`]**: one concurrent probe per context per cycle, health
//!   scoring, context lifecycle
//! - **[`alerts`]**: rule evaluation and the alert state machine
//! - **[`recovery`]**: policy-driven corrective actions with suppression
//! - **[`flow`]** and **[`propagation`]**: message routes and error chains
//! - **[`bottleneck`]**: sustained deviations from a trailing baseline
//! - **[`dashboard`]**: immutable snapshots and recommendations
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ctxwatch::{EngineConfig, InstrumentationBridge, TelemetryEngine};
//!
//! async fn watch(bridge: Arc<dyn InstrumentationBridge>) -> ctxwatch::Result<()> {
//!     let engine = Arc::new(TelemetryEngine::new(EngineConfig::default(), bridge)?);
//!     let handle = engine.start();
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     for alert in engine.active_alerts() {
//!         println!("[{}] {}", alert.severity, alert.message);
//!     }
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod bottleneck;
pub mod collector;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod history;
pub mod propagation;
pub mod recovery;
pub mod state;

#[cfg(test)]
mod testing;

pub use alerts::{AlertEngine, AlertRule, Comparator, RuleCondition, RuleTarget};
pub use config::EngineConfig;
pub use engine::{EngineHandle, TelemetryEngine};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use recovery::{RecoveryHandler, RecoveryPolicy};

// Re-export the data model and bridge boundary for convenience
pub use ctxwatch_adapters::{BridgeError, InstrumentationBridge, ProbeAdapter};
pub use ctxwatch_types as types;
pub use ctxwatch_types::{
    Alert, AlertCategory, AlertState, Bottleneck, ContextRole, DashboardSnapshot, ErrorEvent,
    ExecutionContext, MessageEvent, MetricsSample, PropagationChain, Route, Severity,
};
