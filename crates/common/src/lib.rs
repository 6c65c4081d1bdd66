//! Shared configuration, error types, IDs, timestamps and observability primitives for keel crates.
//!
//! Architecture role:
//! - defines planner/session configuration passed across layers
//! - provides common [`KeelError`] / [`Result`] contracts
//! - hosts the hybrid logical timestamp helpers used by the GC guard and the
//!   timestamp oracle
//! - hosts planner metrics
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`ts`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod ts;

pub use config::{OptimizerBackend, PlannerConfig, StorageEngine};
pub use error::{ErrorKind, KeelError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
pub use ts::Timestamp;
