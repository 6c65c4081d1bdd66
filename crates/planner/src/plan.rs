use keel_common::{ColumnId, IndexId, PlanId, StatementId, TableId};
use keel_sql::ast::Statement;
use keel_sql::ExecuteStmt;
use serde::{Deserialize, Serialize};

use crate::logical_plan::{Expr, LogicalPlan, PlanColumn};
use crate::physical_plan::PhysicalPlan;

/// Output of planning.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Specialized point-access plan, ready to run.
    Fast(FastPlan),
    /// Built but not yet optimized.
    Logical(LogicalPlan),
    /// Statements that need no optimization (session control, SHOW, ...).
    NonLogical(NonLogicalPlan),
    /// Reference to a prepared statement.
    Execute(ExecutePlan),
    /// Optimized plan.
    Physical(PhysicalPlan),
}

impl Plan {
    pub fn kind(&self) -> &'static str {
        match self {
            Plan::Fast(_) => "fast",
            Plan::Logical(_) => "logical",
            Plan::NonLogical(_) => "non_logical",
            Plan::Execute(_) => "execute",
            Plan::Physical(_) => "physical",
        }
    }
}

/// Secondary index used by a point access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAccess {
    pub id: IndexId,
    pub name: String,
}

/// Single-row lookup by a fully specified primary key or unique index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGetPlan {
    pub id: PlanId,
    pub db: String,
    pub table: String,
    pub table_id: TableId,
    /// `None` when the row is addressed by its primary key (handle).
    pub index: Option<IndexAccess>,
    /// Key column and value, in key column order.
    pub key: Vec<(String, Expr)>,
    pub columns: Vec<PlanColumn>,
    /// `FOR UPDATE`, or the read half of a point update/delete.
    pub lock: bool,
}

impl PointGetPlan {
    pub fn is_primary_key_lookup(&self) -> bool {
        self.index.is_none()
    }
}

/// Multi-row lookup `pk IN (...)` on a single-column primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPointGetPlan {
    pub id: PlanId,
    pub db: String,
    pub table: String,
    pub table_id: TableId,
    pub key_column: String,
    pub keys: Vec<Expr>,
    pub columns: Vec<PlanColumn>,
    pub lock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FastPlan {
    PointGet(PointGetPlan),
    BatchPointGet(BatchPointGetPlan),
    Update {
        id: PlanId,
        point: PointGetPlan,
        assignments: Vec<(String, Expr)>,
    },
    Delete {
        id: PlanId,
        point: PointGetPlan,
    },
}

impl FastPlan {
    /// A primary key point read: the only fast plan that can fetch its row
    /// with a single read.
    pub fn is_pure_primary_key_get(&self) -> bool {
        matches!(self, FastPlan::PointGet(p) if p.is_primary_key_lookup())
    }

    pub fn db_table(&self) -> (&str, &str) {
        match self {
            FastPlan::PointGet(p)
            | FastPlan::Update { point: p, .. }
            | FastPlan::Delete { point: p, .. } => (&p.db, &p.table),
            FastPlan::BatchPointGet(b) => (&b.db, &b.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonLogicalKind {
    Prepare,
    Deallocate,
    Set,
    Show,
    Begin,
    Commit,
    Rollback,
    Use,
    Explain,
}

/// Statement passed through to execution as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct NonLogicalPlan {
    pub kind: NonLogicalKind,
    pub statement: Statement,
}

/// `EXECUTE` of a prepared statement. `plan` is filled by the prepared
/// statement re-optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutePlan {
    pub stmt: ExecuteStmt,
    pub statement_id: Option<StatementId>,
    pub plan: Option<Box<Plan>>,
    /// Whether `plan` came from the prepared plan cache.
    pub from_cache: bool,
}

impl ExecutePlan {
    pub fn new(stmt: ExecuteStmt) -> Self {
        Self {
            stmt,
            statement_id: None,
            plan: None,
            from_cache: false,
        }
    }
}

/// Plan-node and plan-column id allocators for one planning call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdAllocator {
    plan: u32,
    column: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.plan = 0;
        self.column = 0;
    }

    pub fn next_plan_id(&mut self) -> PlanId {
        self.plan += 1;
        PlanId(self.plan)
    }

    pub fn next_column_id(&mut self) -> ColumnId {
        self.column += 1;
        ColumnId(self.column)
    }

    /// Number of plan ids handed out since the last reset.
    pub fn plan_ids_allocated(&self) -> u32 {
        self.plan
    }

    pub fn column_ids_allocated(&self) -> u64 {
        self.column
    }
}

/// Rewrite rules the built plan can benefit from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptFlags {
    pub constant_folding: bool,
    pub filter_merge: bool,
    pub predicate_pushdown: bool,
    pub column_pruning: bool,
    pub join_hinting: bool,
}

impl OptFlags {
    pub fn all() -> Self {
        Self {
            constant_folding: true,
            filter_merge: true,
            predicate_pushdown: true,
            column_pruning: true,
            join_hinting: true,
        }
    }

    pub fn union(self, other: OptFlags) -> Self {
        Self {
            constant_folding: self.constant_folding || other.constant_folding,
            filter_merge: self.filter_merge || other.filter_merge,
            predicate_pushdown: self.predicate_pushdown || other.predicate_pushdown,
            column_pruning: self.column_pruning || other.column_pruning,
            join_hinting: self.join_hinting || other.join_hinting,
        }
    }
}
