//! Session state and the plan selection orchestrator.
//!
//! Architecture role:
//! - [`session`] owns per-connection variables and collaborators
//! - [`optimize`] turns one parsed statement into an executable plan
//! - [`guard`] scopes engine eligibility to a single planning call
//! - [`txn`] starts the transaction timestamp request, possibly while
//!   planning is still running

pub mod guard;
pub mod optimize;
pub mod prepared;
pub mod session;
pub mod txn;

pub use guard::EngineRestriction;
pub use optimize::{optimize, Optimized, PlanPath, QueryContext};
pub use prepared::{get_prepared_stmt, is_read_only};
pub use session::{PreparedStatement, Session, SessionVars, StatementContext, DEFAULT_DB};
pub use txn::{LocalOracle, TimestampAcquisition, TimestampOracle, TxnFuture};
