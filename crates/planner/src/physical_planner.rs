use keel_common::{KeelError, Result};
use tracing::debug;

use crate::cost::{
    access_paths, filter_selectivity, Cost, PhysicalContext, ScanRef, CPU_ROW, HASH_BUILD_ROW,
    HASH_PROBE_ROW, NETWORK_BYTE, ROW_LOOKUP,
};
use crate::logical_plan::{split_conjuncts, AggExpr, Expr, JoinStrategyHint, LogicalPlan, PlanColumn};
use crate::physical_plan::{
    BroadcastExchange, BuildSide, DeleteExec, ExchangeExec, FilterExec, FinalHashAggregateExec,
    HashJoinExec, InsertExec, LimitExec, PartialHashAggregateExec, PartitioningSpec, PhysicalPlan,
    ProjectExec, ShuffleReadExchange, ShuffleWriteExchange, UpdateExec, ValuesExec,
};

/// Rule-pipeline physical planner: lowers an optimized logical plan, picking
/// the cheapest access path per scan and the cheapest distribution per join.
///
/// Contracts:
/// - logical semantics are preserved;
/// - aggregate lowers to `PartialHashAggregate -> Exchange -> FinalHashAggregate`;
/// - explicit join hints are honored; `Auto` joins are costed;
/// - a scan with no eligible access path fails with `NoPlanFound`.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalPlanner<'a> {
    ctx: PhysicalContext<'a>,
}

impl<'a> PhysicalPlanner<'a> {
    pub fn new(ctx: PhysicalContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn create_physical_plan(&self, logical: &LogicalPlan) -> Result<PhysicalPlan> {
        let (plan, cost) = self.plan(logical)?;
        debug!(
            operator = "PhysicalPlanner",
            cost = cost.total,
            rows = cost.rows,
            "selected physical plan"
        );
        Ok(plan)
    }

    fn plan(&self, logical: &LogicalPlan) -> Result<(PhysicalPlan, Cost)> {
        match logical {
            LogicalPlan::TableScan {
                id,
                db,
                table,
                qualifier,
                columns,
                projection,
                filters,
                hints,
            } => cheapest(access_paths(
                &self.ctx,
                ScanRef {
                    db,
                    table,
                    qualifier,
                    columns,
                    projection: projection.as_deref(),
                    filters,
                    hints,
                    id: *id,
                },
            )?),
            LogicalPlan::Values { columns, rows, .. } => Ok(implement_values(columns, rows)),
            LogicalPlan::Filter {
                predicate, input, ..
            } => Ok(implement_filter(predicate, self.plan(input)?)),
            LogicalPlan::Projection { exprs, input, .. } => {
                Ok(implement_projection(exprs, self.plan(input)?))
            }
            LogicalPlan::Join {
                left,
                right,
                on,
                strategy_hint,
                ..
            } => {
                let l = self.plan(left)?;
                let r = self.plan(right)?;
                cheapest(implement_join(&self.ctx, &l, &r, on, *strategy_hint))
            }
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                input,
                ..
            } => Ok(implement_aggregate(
                &self.ctx,
                group_exprs,
                aggr_exprs,
                self.plan(input)?,
            )),
            LogicalPlan::Limit { n, input, .. } => Ok(implement_limit(*n, self.plan(input)?)),
            LogicalPlan::Insert {
                db,
                table,
                columns,
                on_duplicate,
                input,
                ..
            } => Ok(implement_write(
                WriteTarget::Insert {
                    db,
                    table,
                    columns,
                    on_duplicate,
                },
                self.plan(input)?,
            )),
            LogicalPlan::Update {
                db,
                table,
                assignments,
                input,
                ..
            } => Ok(implement_write(
                WriteTarget::Update {
                    db,
                    table,
                    assignments,
                },
                self.plan(input)?,
            )),
            LogicalPlan::Delete {
                db, table, input, ..
            } => Ok(implement_write(
                WriteTarget::Delete { db, table },
                self.plan(input)?,
            )),
        }
    }
}

/// Minimum-cost alternative.
pub(crate) fn cheapest(candidates: Vec<(PhysicalPlan, Cost)>) -> Result<(PhysicalPlan, Cost)> {
    candidates
        .into_iter()
        .min_by(|a, b| a.1.total.total_cmp(&b.1.total))
        .ok_or_else(|| KeelError::NoPlanFound("no candidate implementation".to_string()))
}

pub(crate) fn implement_values(columns: &[PlanColumn], rows: &[Vec<Expr>]) -> (PhysicalPlan, Cost) {
    let n = rows.len() as f64;
    (
        PhysicalPlan::Values(ValuesExec {
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            rows: rows.to_vec(),
        }),
        Cost::new(n, 8.0 * columns.len() as f64, n * CPU_ROW),
    )
}

pub(crate) fn implement_filter(predicate: &Expr, input: (PhysicalPlan, Cost)) -> (PhysicalPlan, Cost) {
    let (child, c) = input;
    let selectivity = filter_selectivity(&split_conjuncts(predicate.clone()));
    (
        PhysicalPlan::Filter(FilterExec {
            predicate: predicate.clone(),
            input: Box::new(child),
        }),
        Cost::new(c.rows * selectivity, c.row_bytes, c.total + c.rows * CPU_ROW),
    )
}

pub(crate) fn implement_projection(
    exprs: &[(Expr, PlanColumn)],
    input: (PhysicalPlan, Cost),
) -> (PhysicalPlan, Cost) {
    let (child, c) = input;
    (
        PhysicalPlan::Project(ProjectExec {
            exprs: exprs
                .iter()
                .map(|(e, col)| (e.clone(), col.name.clone()))
                .collect(),
            input: Box::new(child),
        }),
        Cost::new(c.rows, 8.0 * exprs.len() as f64, c.total + c.rows * CPU_ROW),
    )
}

pub(crate) fn implement_limit(n: usize, input: (PhysicalPlan, Cost)) -> (PhysicalPlan, Cost) {
    let (child, c) = input;
    (
        PhysicalPlan::Limit(LimitExec {
            n,
            input: Box::new(child),
        }),
        Cost::new(c.rows.min(n as f64), c.row_bytes, c.total),
    )
}

/// Hash join alternatives. A non-`Auto` hint admits only its own strategy;
/// `Auto` admits broadcast of either side under the threshold, and shuffle.
pub(crate) fn implement_join(
    ctx: &PhysicalContext<'_>,
    left: &(PhysicalPlan, Cost),
    right: &(PhysicalPlan, Cost),
    on: &[(String, String)],
    hint: JoinStrategyHint,
) -> Vec<(PhysicalPlan, Cost)> {
    let (l, lc) = left;
    let (r, rc) = right;
    let out_rows = lc.rows.max(rc.rows);
    let out_bytes = lc.row_bytes + rc.row_bytes;
    let inputs = lc.total + rc.total;
    let fanout = ctx.shuffle_partitions as f64;
    let threshold = ctx.broadcast_threshold_bytes as f64;

    let mut out = vec![];
    let allow = |s: JoinStrategyHint| hint == s || hint == JoinStrategyHint::Auto;

    if allow(JoinStrategyHint::BroadcastLeft)
        && (hint != JoinStrategyHint::Auto || lc.bytes() <= threshold)
    {
        let bcast = PhysicalPlan::Exchange(ExchangeExec::Broadcast(BroadcastExchange {
            input: Box::new(l.clone()),
        }));
        let cost = inputs
            + lc.bytes() * NETWORK_BYTE * fanout
            + lc.rows * HASH_BUILD_ROW
            + rc.rows * HASH_PROBE_ROW;
        out.push((
            PhysicalPlan::HashJoin(HashJoinExec {
                left: Box::new(bcast),
                right: Box::new(r.clone()),
                on: on.to_vec(),
                strategy: JoinStrategyHint::BroadcastLeft,
                build_side: BuildSide::Left,
            }),
            Cost::new(out_rows, out_bytes, cost),
        ));
    }
    if allow(JoinStrategyHint::BroadcastRight)
        && (hint != JoinStrategyHint::Auto || rc.bytes() <= threshold)
    {
        let bcast = PhysicalPlan::Exchange(ExchangeExec::Broadcast(BroadcastExchange {
            input: Box::new(r.clone()),
        }));
        let cost = inputs
            + rc.bytes() * NETWORK_BYTE * fanout
            + rc.rows * HASH_BUILD_ROW
            + lc.rows * HASH_PROBE_ROW;
        out.push((
            PhysicalPlan::HashJoin(HashJoinExec {
                left: Box::new(l.clone()),
                right: Box::new(bcast),
                on: on.to_vec(),
                strategy: JoinStrategyHint::BroadcastRight,
                build_side: BuildSide::Right,
            }),
            Cost::new(out_rows, out_bytes, cost),
        ));
    }
    if allow(JoinStrategyHint::Shuffle) {
        let left_keys = on.iter().map(|(lk, _)| lk.clone()).collect();
        let right_keys = on.iter().map(|(_, rk)| rk.clone()).collect();
        let cost = inputs
            + (lc.bytes() + rc.bytes()) * NETWORK_BYTE
            + rc.rows * HASH_BUILD_ROW
            + lc.rows * HASH_PROBE_ROW;
        out.push((
            PhysicalPlan::HashJoin(HashJoinExec {
                left: Box::new(shuffle(l.clone(), left_keys, ctx.shuffle_partitions)),
                right: Box::new(shuffle(r.clone(), right_keys, ctx.shuffle_partitions)),
                on: on.to_vec(),
                strategy: JoinStrategyHint::Shuffle,
                // arbitrary for shuffle joins, executor can decide
                build_side: BuildSide::Right,
            }),
            Cost::new(out_rows, out_bytes, cost),
        ));
    }
    out
}

/// `ShuffleWrite -> ShuffleRead` hash partitioned by `keys`.
fn shuffle(input: PhysicalPlan, keys: Vec<String>, partitions: usize) -> PhysicalPlan {
    let partitioning = if keys.is_empty() {
        PartitioningSpec::Single
    } else {
        PartitioningSpec::HashKeys { keys, partitions }
    };
    let write = PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(ShuffleWriteExchange {
        input: Box::new(input),
        partitioning: partitioning.clone(),
    }));
    PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(ShuffleReadExchange {
        input: Box::new(write),
        partitioning,
    }))
}

pub(crate) fn implement_aggregate(
    ctx: &PhysicalContext<'_>,
    group_exprs: &[Expr],
    aggr_exprs: &[(AggExpr, PlanColumn)],
    input: (PhysicalPlan, Cost),
) -> (PhysicalPlan, Cost) {
    // Aggregate -> Partial -> ShuffleExchange(hash(group_keys)) -> Final
    let (child, c) = input;
    let aggs = aggr_exprs
        .iter()
        .map(|(a, col)| (a.clone(), col.name.clone()))
        .collect::<Vec<_>>();
    let partial = PhysicalPlan::PartialHashAggregate(PartialHashAggregateExec {
        group_exprs: group_exprs.to_vec(),
        aggr_exprs: aggs.clone(),
        input: Box::new(child),
    });
    let keys = group_exprs.iter().map(|e| e.to_string()).collect();
    let read = shuffle(partial, keys, ctx.shuffle_partitions);

    let groups = if group_exprs.is_empty() {
        1.0
    } else {
        (c.rows * 0.1).max(1.0)
    };
    let row_bytes = 8.0 * (group_exprs.len() + aggr_exprs.len()) as f64;
    let partial_rows = groups.min(c.rows) * ctx.shuffle_partitions as f64;
    let cost = c.total + c.rows * CPU_ROW + partial_rows * row_bytes * NETWORK_BYTE;
    (
        PhysicalPlan::FinalHashAggregate(FinalHashAggregateExec {
            group_exprs: group_exprs.to_vec(),
            aggr_exprs: aggs,
            input: Box::new(read),
        }),
        Cost::new(groups, row_bytes, cost),
    )
}

/// Target of a write operator.
pub(crate) enum WriteTarget<'p> {
    Insert {
        db: &'p str,
        table: &'p str,
        columns: &'p [String],
        on_duplicate: &'p [(String, Expr)],
    },
    Update {
        db: &'p str,
        table: &'p str,
        assignments: &'p [(String, Expr)],
    },
    Delete {
        db: &'p str,
        table: &'p str,
    },
}

pub(crate) fn implement_write(target: WriteTarget<'_>, input: (PhysicalPlan, Cost)) -> (PhysicalPlan, Cost) {
    let (child, c) = input;
    let cost = c.total + c.rows * ROW_LOOKUP;
    let plan = match target {
        WriteTarget::Insert {
            db,
            table,
            columns,
            on_duplicate,
        } => PhysicalPlan::Insert(InsertExec {
            db: db.to_string(),
            table: table.to_string(),
            columns: columns.to_vec(),
            on_duplicate: on_duplicate.to_vec(),
            input: Box::new(child),
        }),
        WriteTarget::Update {
            db,
            table,
            assignments,
        } => PhysicalPlan::Update(UpdateExec {
            db: db.to_string(),
            table: table.to_string(),
            assignments: assignments.to_vec(),
            input: Box::new(child),
        }),
        WriteTarget::Delete { db, table } => PhysicalPlan::Delete(DeleteExec {
            db: db.to_string(),
            table: table.to_string(),
            input: Box::new(child),
        }),
    };
    (plan, Cost::new(c.rows, 8.0, cost))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use arrow_schema::DataType;
    use keel_common::{PlanId, StorageEngine};
    use keel_storage::{Catalog, SchemaSnapshot, TableDef};

    use super::PhysicalPlanner;
    use crate::cost::PhysicalContext;
    use crate::hints::TableHints;
    use crate::logical_plan::{AggExpr, Expr, JoinStrategyHint, LogicalPlan, PlanColumn};
    use crate::physical_plan::{ExchangeExec, PartitioningSpec, PhysicalPlan};

    fn snapshot() -> SchemaSnapshot {
        let mut cat = Catalog::new();
        for (id, name, rows) in [(1, "orders", 10_000_000u64), (2, "regions", 20)] {
            cat.register_table(
                TableDef::new(id, "main", name)
                    .with_column("id", DataType::Int64)
                    .with_column("region", DataType::Int64)
                    .with_primary_key(&["id"])
                    .with_stats(rows, rows * 100),
            )
            .unwrap();
        }
        cat.snapshot()
    }

    fn scan(id: u32, table: &str) -> LogicalPlan {
        LogicalPlan::TableScan {
            id: PlanId(id),
            db: "main".to_string(),
            table: table.to_string(),
            qualifier: table.to_string(),
            columns: vec![],
            projection: None,
            filters: vec![],
            hints: TableHints::default(),
        }
    }

    fn plan_with(logical: &LogicalPlan, engines: &[StorageEngine]) -> keel_common::Result<PhysicalPlan> {
        let snap = snapshot();
        let engines = engines.iter().copied().collect::<BTreeSet<_>>();
        let ctx = PhysicalContext {
            snapshot: &snap,
            engines: &engines,
            broadcast_threshold_bytes: 1 << 20,
            shuffle_partitions: 8,
            target_batch_rows: 1024,
        };
        PhysicalPlanner::new(ctx).create_physical_plan(logical)
    }

    #[test]
    fn auto_join_broadcasts_small_side() {
        let logical = LogicalPlan::Join {
            id: PlanId(3),
            left: Box::new(scan(1, "orders")),
            right: Box::new(scan(2, "regions")),
            on: vec![("orders.region".to_string(), "regions.id".to_string())],
            strategy_hint: JoinStrategyHint::Auto,
        };
        let PhysicalPlan::HashJoin(join) = plan_with(&logical, &[StorageEngine::Transactional]).unwrap()
        else {
            panic!("expected hash join");
        };
        assert_eq!(join.strategy, JoinStrategyHint::BroadcastRight);
        assert!(matches!(
            *join.right,
            PhysicalPlan::Exchange(ExchangeExec::Broadcast(_))
        ));
    }

    #[test]
    fn shuffle_hint_is_honored() {
        let logical = LogicalPlan::Join {
            id: PlanId(3),
            left: Box::new(scan(1, "orders")),
            right: Box::new(scan(2, "regions")),
            on: vec![("orders.region".to_string(), "regions.id".to_string())],
            strategy_hint: JoinStrategyHint::Shuffle,
        };
        let PhysicalPlan::HashJoin(join) = plan_with(&logical, &[StorageEngine::Transactional]).unwrap()
        else {
            panic!("expected hash join");
        };
        assert_eq!(join.strategy, JoinStrategyHint::Shuffle);
    }

    #[test]
    fn global_aggregate_uses_single_partition() {
        let logical = LogicalPlan::Aggregate {
            id: PlanId(2),
            group_exprs: vec![],
            aggr_exprs: vec![(
                AggExpr::Count(Expr::lit_i64(1)),
                PlanColumn {
                    id: keel_common::ColumnId(1),
                    name: "COUNT(1)".to_string(),
                    data_type: DataType::Int64,
                },
            )],
            input: Box::new(scan(1, "orders")),
        };
        let PhysicalPlan::FinalHashAggregate(fin) =
            plan_with(&logical, &[StorageEngine::Transactional]).unwrap()
        else {
            panic!("expected final aggregate");
        };
        match *fin.input {
            PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(read)) => {
                assert_eq!(read.partitioning, PartitioningSpec::Single)
            }
            other => panic!("unexpected aggregate input: {other:?}"),
        }
    }

    #[test]
    fn scan_without_eligible_engine_fails() {
        let err = plan_with(&scan(1, "orders"), &[StorageEngine::AnalyticReplica]).unwrap_err();
        assert_eq!(err.kind(), keel_common::ErrorKind::NoPlanFound);
    }
}
