//! Plan model and planning stages: logical plan building, validation
//! (privileges and table locks), point access recognition, rewrite rules,
//! cost-based physical planning and memo search.

pub mod builder;
pub mod cascades;
pub mod cost;
pub mod explain;
pub mod fast_plan;
pub mod hints;
pub mod lock;
pub mod logical_plan;
pub mod optimizer;
pub mod physical_plan;
pub mod physical_planner;
pub mod plan;
pub mod privilege;

pub use builder::*;
pub use cost::PhysicalContext;
pub use explain::{explain, explain_logical, explain_physical};
pub use fast_plan::*;
pub use hints::*;
pub use lock::*;
pub use logical_plan::*;
pub use optimizer::*;
pub use physical_plan::*;
pub use physical_planner::PhysicalPlanner;
pub use plan::*;
pub use privilege::*;
