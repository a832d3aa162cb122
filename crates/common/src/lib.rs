#![deny(missing_docs)]

//! Shared configuration, error types, IDs, memory budgeting, and
//! observability primitives for Riffle crates.
//!
//! Architecture role:
//! - defines engine/runtime configuration passed across layers
//! - provides common [`RiffleError`] / [`Result`] contracts
//! - hosts the per-operator [`MemTracker`] budget chain
//! - hosts the operator metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

/// Shared engine/runtime configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Memory budget tracking.
pub mod memory;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::EngineConfig;
pub use error::{Result, RiffleError};
pub use ids::*;
pub use memory::MemTracker;
pub use metrics::{MetricsRegistry, OperatorMetrics};
