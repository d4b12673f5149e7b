//! # ctxwatch-types
//!
//! Core types for multi-context telemetry. This crate defines the schema shared
//! by the ctxwatch engine and anything that consumes what it publishes
//! (dashboards, report generators, exporters).
//!
//! ## Design Goals
//!
//! - **Zero required dependencies**: Core types work without any serialization framework
//! - **Optional serialization**: Enable the `serde` feature for JSON export
//! - **Immutable values**: Samples, chains and snapshots are built once and shared
//!   behind `Arc`, never patched in place by readers
//! - **Closed vocabularies**: Roles, severities and metric paths are enums, so
//!   loosely-typed bridge data is validated at ingestion
//!
//! ## Example
//!
//! ```rust
//! use ctxwatch_types::{ContextRole, MetricPath, MetricsSample};
//!
//! let sample = MetricsSample::builder()
//!     .sequence(1)
//!     .timestamp_ms(1_700_000_000_000)
//!     .context("svc", ContextRole::BackgroundWorker, |c| {
//!         c.memory_usage_mb(48.0).response_time_ms(12.0).health_score(0.93)
//!     })
//!     .build();
//!
//! let path: MetricPath = "response_time_ms".parse().unwrap();
//! assert_eq!(sample.context_metric("svc", path), Some(12.0));
//! ```

mod alert;
mod bottleneck;
mod context;
mod dashboard;
mod flow;
mod metric;
mod propagation;
mod recovery;
mod sample;

pub use alert::*;
pub use bottleneck::*;
pub use context::*;
pub use dashboard::*;
pub use flow::*;
pub use metric::*;
pub use propagation::*;
pub use recovery::*;
pub use sample::*;

/// Current schema version of exported samples and snapshots.
///
/// Consumers of exported history should check this before decoding.
pub const SCHEMA_VERSION: u32 = 1;

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
