//! Schema snapshots, the restricted system query interface and the GC
//! snapshot consistency guard.
//!
//! Architecture role:
//! - [`catalog`] holds table metadata; planning reads an immutable
//!   [`SchemaSnapshot`] taken per statement
//! - [`system_table`] is the narrow channel to internal system variables
//! - [`gc`] refuses historical reads older than the GC safe point and toggles
//!   GC

pub mod catalog;
pub mod gc;
pub mod stats;
pub mod system_table;

pub use catalog::*;
pub use stats::TableStats;
pub use system_table::{MemSystemTable, RestrictedSqlExecutor, SystemRow};
