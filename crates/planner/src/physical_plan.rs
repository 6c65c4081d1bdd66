use keel_common::StorageEngine;
use serde::{Deserialize, Serialize};

use crate::logical_plan::{AggExpr, Expr, JoinStrategyHint};
use crate::plan::{IndexAccess, PointGetPlan};

/// The physical operator graph.
///
/// Operators still carry logical [`Expr`]s; execution binds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysicalPlan {
    /// Full scan on one storage engine.
    TableScan(TableScanExec),
    /// Secondary index range followed by a row fetch per match.
    IndexLookup(IndexLookupExec),
    /// Single-row primary key or unique index access.
    PointGet(PointGetPlan),
    /// Constant rows.
    Values(ValuesExec),
    /// Row filter.
    Filter(FilterExec),
    /// Projection.
    Project(ProjectExec),
    /// Batch coalescing.
    CoalesceBatches(CoalesceBatchesExec),

    /// Partial aggregate.
    PartialHashAggregate(PartialHashAggregateExec),
    /// Final aggregate.
    FinalHashAggregate(FinalHashAggregateExec),

    /// Hash join.
    HashJoin(HashJoinExec),

    /// Data exchange boundary.
    Exchange(ExchangeExec),

    /// Limit.
    Limit(LimitExec),

    Insert(InsertExec),
    Update(UpdateExec),
    Delete(DeleteExec),
}

impl PhysicalPlan {
    /// Returns direct child operators.
    pub fn children(&self) -> Vec<&PhysicalPlan> {
        match self {
            PhysicalPlan::TableScan(_)
            | PhysicalPlan::IndexLookup(_)
            | PhysicalPlan::PointGet(_)
            | PhysicalPlan::Values(_) => vec![],
            PhysicalPlan::Filter(x) => vec![x.input.as_ref()],
            PhysicalPlan::Project(x) => vec![x.input.as_ref()],
            PhysicalPlan::CoalesceBatches(x) => vec![x.input.as_ref()],
            PhysicalPlan::PartialHashAggregate(x) => vec![x.input.as_ref()],
            PhysicalPlan::FinalHashAggregate(x) => vec![x.input.as_ref()],
            PhysicalPlan::HashJoin(x) => vec![x.left.as_ref(), x.right.as_ref()],
            PhysicalPlan::Exchange(x) => match x {
                ExchangeExec::ShuffleWrite(e) => vec![e.input.as_ref()],
                ExchangeExec::ShuffleRead(e) => vec![e.input.as_ref()],
                ExchangeExec::Broadcast(e) => vec![e.input.as_ref()],
            },
            PhysicalPlan::Limit(x) => vec![x.input.as_ref()],
            PhysicalPlan::Insert(x) => vec![x.input.as_ref()],
            PhysicalPlan::Update(x) => vec![x.input.as_ref()],
            PhysicalPlan::Delete(x) => vec![x.input.as_ref()],
        }
    }

    /// Storage engines read anywhere in this plan, in first-seen order.
    pub fn engines(&self) -> Vec<StorageEngine> {
        let mut out = vec![];
        let mut stack = vec![self];
        while let Some(p) = stack.pop() {
            let engine = match p {
                PhysicalPlan::TableScan(s) => Some(s.engine),
                PhysicalPlan::IndexLookup(_) | PhysicalPlan::PointGet(_) => {
                    Some(StorageEngine::Transactional)
                }
                _ => None,
            };
            if let Some(e) = engine {
                if !out.contains(&e) {
                    out.push(e);
                }
            }
            let mut children = p.children();
            children.reverse();
            stack.extend(children);
        }
        out
    }
}

/// Full table scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableScanExec {
    pub db: String,
    pub table: String,
    /// Name output columns are qualified with.
    pub qualifier: String,
    pub engine: StorageEngine,
    /// Column names (pushdown) if known.
    pub projection: Option<Vec<String>>,
    /// Pushed predicates, evaluated by the storage engine.
    pub filters: Vec<Expr>,
}

/// Index range access.
///
/// Contract:
/// - `key` holds equality conditions over a prefix of the index columns;
///   empty means a full index scan.
/// - every matching entry costs one extra row read from the primary data
///   (the "double read"), so the plan is only chosen when the prefix is
///   selective enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexLookupExec {
    pub db: String,
    pub table: String,
    pub qualifier: String,
    pub index: IndexAccess,
    pub key: Vec<(String, Expr)>,
    /// Residual predicates evaluated after the row fetch.
    pub filters: Vec<Expr>,
    pub projection: Option<Vec<String>>,
}

/// Constant rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuesExec {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

/// Row filter operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExec {
    /// Predicate.
    pub predicate: Expr,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Projection operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectExec {
    /// (expr, output_name)
    pub exprs: Vec<(Expr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Batch coalescing operator, placed over filtered columnar scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalesceBatchesExec {
    /// Desired row count per output batch.
    pub target_batch_rows: usize,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Phase-1 hash aggregate.
///
/// Must be followed by compatible repartition + final aggregate for global SQL
/// aggregate semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialHashAggregateExec {
    /// Grouping expressions.
    pub group_exprs: Vec<Expr>,
    /// Aggregate expressions and output names.
    pub aggr_exprs: Vec<(AggExpr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Phase-2 hash aggregate merging partial states after shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalHashAggregateExec {
    /// Grouping expressions.
    pub group_exprs: Vec<Expr>,
    /// Aggregate expressions and output names.
    pub aggr_exprs: Vec<(AggExpr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Side chosen to build the hash table for [`HashJoinExec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildSide {
    /// Build hash table from left input.
    Left,
    /// Build hash table from right input.
    Right,
}

/// Inner hash equi-join.
///
/// Contract:
/// - `on` is positional key mapping `(left_key, right_key)`.
/// - `strategy` records the chosen distribution; exchange nodes define the
///   actual data movement.
/// - `build_side` is the broadcast side for broadcast joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashJoinExec {
    pub left: Box<PhysicalPlan>,
    pub right: Box<PhysicalPlan>,
    /// Join key pairs `(left_key, right_key)`.
    pub on: Vec<(String, String)>,
    pub strategy: JoinStrategyHint,
    pub build_side: BuildSide,
}

/// Stage-boundary exchange operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeExec {
    /// Shuffle write boundary.
    ShuffleWrite(ShuffleWriteExchange),
    /// Shuffle read boundary.
    ShuffleRead(ShuffleReadExchange),
    /// Broadcast boundary.
    Broadcast(BroadcastExchange),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleWriteExchange {
    pub input: Box<PhysicalPlan>,
    pub partitioning: PartitioningSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleReadExchange {
    pub input: Box<PhysicalPlan>,
    pub partitioning: PartitioningSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastExchange {
    pub input: Box<PhysicalPlan>,
}

/// Partitioning contract used by exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitioningSpec {
    /// Hash partition by key columns into N partitions.
    HashKeys {
        /// Partition key names.
        keys: Vec<String>,
        /// Partition count.
        partitions: usize,
    },
    /// Single partition.
    Single,
}

/// Limit operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitExec {
    /// Maximum number of rows.
    pub n: usize,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Row insert into the transactional store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertExec {
    pub db: String,
    pub table: String,
    pub columns: Vec<String>,
    /// `ON DUPLICATE KEY UPDATE` assignments; empty for plain inserts.
    pub on_duplicate: Vec<(String, Expr)>,
    pub input: Box<PhysicalPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateExec {
    pub db: String,
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    /// Rows to update.
    pub input: Box<PhysicalPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteExec {
    pub db: String,
    pub table: String,
    /// Rows to delete.
    pub input: Box<PhysicalPlan>,
}
