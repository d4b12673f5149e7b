//! # ctxwatch-adapters
//!
//! The boundary between ctxwatch and the remote instrumentation bridge.
//!
//! This crate defines the [`InstrumentationBridge`] trait the engine talks
//! to, and the [`ProbeAdapter`] that turns raw bridge calls into bounded,
//! never-failing probes of a single execution context.
//!
//! ## Provided Bridges
//!
//! - **HTTP** (`http` feature) - JSON client for a bridge service that
//!   exposes contexts over REST
//!
//! Anything else (an in-process debugger connection, a test double) only has
//! to implement the trait.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ctxwatch_adapters::{InstrumentationBridge, ProbeAdapter};
//!
//! async fn report(bridge: Arc<dyn InstrumentationBridge>) {
//!     let adapter = ProbeAdapter::builder(bridge).build();
//!
//!     if let Ok(contexts) = adapter.discover(Duration::from_millis(500)).await {
//!         for ctx in contexts {
//!             let result = adapter.sample(&ctx.id, Duration::from_millis(250)).await;
//!             println!("{}: {:?}", ctx.id, result.status());
//!         }
//!     }
//! }
//! ```

pub mod bridge;
pub mod error;
pub mod probe;

#[cfg(feature = "http")]
pub mod http;

pub use bridge::{
    ConsoleEntry, ConsoleLevel, ContextDescriptor, InstrumentationBridge, NetworkEntry,
    StructuralSnapshot,
};
pub use error::BridgeError;
pub use probe::{
    ProbeAdapter, ProbeAdapterBuilder, ProbeData, ProbeFailure, ProbeFailureKind, ProbeResult,
};
