//! Memo-based cost search.
//!
//! The logical plan is copied into a memo of equivalence groups. Exploration
//! applies transformation rules until no rule adds a new expression (or the
//! round limit is hit); implementation then picks, per group, the cheapest
//! physical alternative over the cheapest child winners.

use keel_common::{ErrorKind, KeelError, PlanId, Result};
use tracing::debug;

use crate::cost::{access_paths, Cost, PhysicalContext, ScanRef};
use crate::hints::TableHints;
use crate::logical_plan::{
    split_conjuncts, AggExpr, Expr, JoinStrategyHint, LogicalPlan, PlanColumn,
};
use crate::physical_plan::PhysicalPlan;
use crate::physical_planner::{
    cheapest, implement_aggregate, implement_filter, implement_join, implement_limit,
    implement_projection, implement_values, implement_write, WriteTarget,
};

const MAX_EXPLORE_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub usize);

/// Scan payload; a scan is a leaf so it carries everything itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOp {
    pub id: PlanId,
    pub db: String,
    pub table: String,
    pub qualifier: String,
    pub columns: Vec<PlanColumn>,
    pub projection: Option<Vec<String>>,
    pub filters: Vec<Expr>,
    pub hints: TableHints,
}

/// A logical operator with its inputs replaced by memo groups.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Scan(ScanOp),
    Values {
        columns: Vec<PlanColumn>,
        rows: Vec<Vec<Expr>>,
    },
    Filter {
        predicate: Expr,
    },
    Projection {
        exprs: Vec<(Expr, PlanColumn)>,
    },
    Join {
        on: Vec<(String, String)>,
        hint: JoinStrategyHint,
    },
    Aggregate {
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<(AggExpr, PlanColumn)>,
    },
    Limit {
        n: usize,
    },
    Insert {
        db: String,
        table: String,
        columns: Vec<String>,
        on_duplicate: Vec<(String, Expr)>,
    },
    Update {
        db: String,
        table: String,
        assignments: Vec<(String, Expr)>,
    },
    Delete {
        db: String,
        table: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupExpr {
    pub op: Operator,
    pub children: Vec<GroupId>,
}

#[derive(Debug, Default)]
struct Group {
    exprs: Vec<GroupExpr>,
    winner: Option<(PhysicalPlan, Cost)>,
}

/// Equivalence groups of logical expressions.
#[derive(Debug, Default)]
pub struct Memo {
    groups: Vec<Group>,
}

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `plan` into the memo, one new group per node.
    pub fn insert_plan(&mut self, plan: &LogicalPlan) -> GroupId {
        let children = plan
            .children()
            .into_iter()
            .map(|c| self.insert_plan(c))
            .collect::<Vec<_>>();
        let op = match plan {
            LogicalPlan::TableScan {
                id,
                db,
                table,
                qualifier,
                columns,
                projection,
                filters,
                hints,
            } => Operator::Scan(ScanOp {
                id: *id,
                db: db.clone(),
                table: table.clone(),
                qualifier: qualifier.clone(),
                columns: columns.clone(),
                projection: projection.clone(),
                filters: filters.clone(),
                hints: hints.clone(),
            }),
            LogicalPlan::Values { columns, rows, .. } => Operator::Values {
                columns: columns.clone(),
                rows: rows.clone(),
            },
            LogicalPlan::Filter { predicate, .. } => Operator::Filter {
                predicate: predicate.clone(),
            },
            LogicalPlan::Projection { exprs, .. } => Operator::Projection {
                exprs: exprs.clone(),
            },
            LogicalPlan::Join {
                on, strategy_hint, ..
            } => Operator::Join {
                on: on.clone(),
                hint: *strategy_hint,
            },
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                ..
            } => Operator::Aggregate {
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
            },
            LogicalPlan::Limit { n, .. } => Operator::Limit { n: *n },
            LogicalPlan::Insert {
                db,
                table,
                columns,
                on_duplicate,
                ..
            } => Operator::Insert {
                db: db.clone(),
                table: table.clone(),
                columns: columns.clone(),
                on_duplicate: on_duplicate.clone(),
            },
            LogicalPlan::Update {
                db,
                table,
                assignments,
                ..
            } => Operator::Update {
                db: db.clone(),
                table: table.clone(),
                assignments: assignments.clone(),
            },
            LogicalPlan::Delete { db, table, .. } => Operator::Delete {
                db: db.clone(),
                table: table.clone(),
            },
        };
        self.groups.push(Group {
            exprs: vec![GroupExpr { op, children }],
            winner: None,
        });
        GroupId(self.groups.len() - 1)
    }

    pub fn group_exprs(&self, group: GroupId) -> &[GroupExpr] {
        &self.groups[group.0].exprs
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_exprs(&self) -> usize {
        self.groups.iter().map(|g| g.exprs.len()).sum()
    }

    /// Adds `expr` to `group` unless an equal expression is already there.
    fn add_expr(&mut self, group: GroupId, expr: GroupExpr) -> bool {
        let exprs = &mut self.groups[group.0].exprs;
        if exprs.contains(&expr) {
            return false;
        }
        exprs.push(expr);
        true
    }

    /// Applies `rules` to every expression until nothing new appears.
    pub fn explore(&mut self, rules: &[&dyn TransformationRule]) {
        for round in 0..MAX_EXPLORE_ROUNDS {
            let mut added = 0usize;
            for g in 0..self.groups.len() {
                let mut e = 0;
                while e < self.groups[g].exprs.len() {
                    let expr = self.groups[g].exprs[e].clone();
                    for rule in rules {
                        for alt in rule.apply(self, &expr) {
                            if self.add_expr(GroupId(g), alt) {
                                added += 1;
                                debug!(operator = "Cascades", rule = rule.name(), group = g, "added expression");
                            }
                        }
                    }
                    e += 1;
                }
            }
            if added == 0 {
                debug!(operator = "Cascades", rounds = round + 1, "exploration reached fixpoint");
                return;
            }
        }
    }

    /// Cheapest physical plan for `group`, memoized.
    fn best(&mut self, ctx: &PhysicalContext<'_>, group: GroupId) -> Result<(PhysicalPlan, Cost)> {
        if let Some(w) = &self.groups[group.0].winner {
            return Ok(w.clone());
        }
        let mut candidates = vec![];
        let mut last_err = None;
        for i in 0..self.groups[group.0].exprs.len() {
            let expr = self.groups[group.0].exprs[i].clone();
            match self.implement(ctx, &expr) {
                Ok(alts) => candidates.extend(alts),
                Err(e) if e.kind() == ErrorKind::NoPlanFound => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        if candidates.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                KeelError::NoPlanFound(format!("group {} has no implementation", group.0))
            }));
        }
        let winner = cheapest(candidates)?;
        self.groups[group.0].winner = Some(winner.clone());
        Ok(winner)
    }

    fn implement(
        &mut self,
        ctx: &PhysicalContext<'_>,
        expr: &GroupExpr,
    ) -> Result<Vec<(PhysicalPlan, Cost)>> {
        let mut inputs = vec![];
        for child in &expr.children {
            inputs.push(self.best(ctx, *child)?);
        }
        let mut inputs = inputs.into_iter();
        let mut input = || {
            inputs
                .next()
                .ok_or_else(|| KeelError::NoPlanFound("operator input missing".to_string()))
        };
        Ok(match &expr.op {
            Operator::Scan(s) => access_paths(
                ctx,
                ScanRef {
                    db: &s.db,
                    table: &s.table,
                    qualifier: &s.qualifier,
                    columns: &s.columns,
                    projection: s.projection.as_deref(),
                    filters: &s.filters,
                    hints: &s.hints,
                    id: s.id,
                },
            )?,
            Operator::Values { columns, rows } => vec![implement_values(columns, rows)],
            Operator::Filter { predicate } => vec![implement_filter(predicate, input()?)],
            Operator::Projection { exprs } => vec![implement_projection(exprs, input()?)],
            Operator::Join { on, hint } => {
                let l = input()?;
                let r = input()?;
                implement_join(ctx, &l, &r, on, *hint)
            }
            Operator::Aggregate {
                group_exprs,
                aggr_exprs,
            } => vec![implement_aggregate(ctx, group_exprs, aggr_exprs, input()?)],
            Operator::Limit { n } => vec![implement_limit(*n, input()?)],
            Operator::Insert {
                db,
                table,
                columns,
                on_duplicate,
            } => vec![implement_write(
                WriteTarget::Insert {
                    db,
                    table,
                    columns,
                    on_duplicate,
                },
                input()?,
            )],
            Operator::Update {
                db,
                table,
                assignments,
            } => vec![implement_write(
                WriteTarget::Update {
                    db,
                    table,
                    assignments,
                },
                input()?,
            )],
            Operator::Delete { db, table } => {
                vec![implement_write(WriteTarget::Delete { db, table }, input()?)]
            }
        })
    }
}

/// Produces logically equivalent alternatives for one memo expression.
pub trait TransformationRule {
    fn name(&self) -> &'static str;
    fn apply(&self, memo: &Memo, expr: &GroupExpr) -> Vec<GroupExpr>;
}

/// `Filter(Scan)` becomes a scan carrying the filter's conjuncts.
#[derive(Debug, Default)]
pub struct FilterIntoScan;

impl TransformationRule for FilterIntoScan {
    fn name(&self) -> &'static str {
        "filter_into_scan"
    }

    fn apply(&self, memo: &Memo, expr: &GroupExpr) -> Vec<GroupExpr> {
        let (Operator::Filter { predicate }, [child]) = (&expr.op, expr.children.as_slice()) else {
            return vec![];
        };
        memo.group_exprs(*child)
            .iter()
            .filter_map(|c| match &c.op {
                Operator::Scan(scan) => {
                    let mut scan = scan.clone();
                    for conj in split_conjuncts(predicate.clone()) {
                        if !scan.filters.contains(&conj) {
                            scan.filters.push(conj);
                        }
                    }
                    Some(GroupExpr {
                        op: Operator::Scan(scan),
                        children: vec![],
                    })
                }
                _ => None,
            })
            .collect()
    }
}

/// `A ⋈ B` becomes `B ⋈ A`. Columns are resolved by name above a join, so
/// the changed column order is invisible to parents.
#[derive(Debug, Default)]
pub struct JoinCommute;

impl TransformationRule for JoinCommute {
    fn name(&self) -> &'static str {
        "join_commute"
    }

    fn apply(&self, _memo: &Memo, expr: &GroupExpr) -> Vec<GroupExpr> {
        let (Operator::Join { on, hint }, [l, r]) = (&expr.op, expr.children.as_slice()) else {
            return vec![];
        };
        let hint = match hint {
            JoinStrategyHint::BroadcastLeft => JoinStrategyHint::BroadcastRight,
            JoinStrategyHint::BroadcastRight => JoinStrategyHint::BroadcastLeft,
            other => *other,
        };
        vec![GroupExpr {
            op: Operator::Join {
                on: on.iter().map(|(a, b)| (b.clone(), a.clone())).collect(),
                hint,
            },
            children: vec![*r, *l],
        }]
    }
}

/// Finds the minimum-cost physical plan for `plan`.
pub fn find_best_plan(plan: &LogicalPlan, ctx: &PhysicalContext<'_>) -> Result<PhysicalPlan> {
    let mut memo = Memo::new();
    let root = memo.insert_plan(plan);
    memo.explore(&[&FilterIntoScan, &JoinCommute]);
    let (best, cost) = memo.best(ctx, root)?;
    debug!(
        operator = "Cascades",
        groups = memo.num_groups(),
        exprs = memo.num_exprs(),
        cost = cost.total,
        "selected physical plan"
    );
    Ok(best)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use arrow_schema::DataType;
    use keel_common::{ColumnId, ErrorKind, PlanId, StorageEngine};
    use keel_storage::{Catalog, SchemaSnapshot, TableDef};

    use super::{find_best_plan, FilterIntoScan, JoinCommute, Memo};
    use crate::cost::PhysicalContext;
    use crate::hints::TableHints;
    use crate::logical_plan::{Expr, JoinStrategyHint, LogicalPlan, PlanColumn};
    use crate::physical_plan::PhysicalPlan;

    fn snapshot() -> SchemaSnapshot {
        let mut cat = Catalog::new();
        cat.register_table(
            TableDef::new(1, "main", "t")
                .with_column("id", DataType::Int64)
                .with_column("v", DataType::Utf8)
                .with_primary_key(&["id"])
                .with_stats(100_000, 10_000_000),
        )
        .unwrap();
        cat.register_table(
            TableDef::new(2, "main", "s")
                .with_column("id", DataType::Int64)
                .with_primary_key(&["id"])
                .with_stats(10, 100),
        )
        .unwrap();
        cat.snapshot()
    }

    fn col(name: &str) -> PlanColumn {
        PlanColumn {
            id: ColumnId(0),
            name: name.to_string(),
            data_type: DataType::Int64,
        }
    }

    fn scan(id: u32, table: &str) -> LogicalPlan {
        LogicalPlan::TableScan {
            id: PlanId(id),
            db: "main".to_string(),
            table: table.to_string(),
            qualifier: table.to_string(),
            columns: vec![col("id")],
            projection: None,
            filters: vec![],
            hints: TableHints::default(),
        }
    }

    fn best(plan: &LogicalPlan, engines: &[StorageEngine]) -> keel_common::Result<PhysicalPlan> {
        let snap = snapshot();
        let engines = engines.iter().copied().collect::<BTreeSet<_>>();
        let ctx = PhysicalContext {
            snapshot: &snap,
            engines: &engines,
            broadcast_threshold_bytes: 1 << 20,
            shuffle_partitions: 4,
            target_batch_rows: 1024,
        };
        find_best_plan(plan, &ctx)
    }

    #[test]
    fn filter_over_pk_scan_becomes_point_get() {
        let plan = LogicalPlan::Filter {
            id: PlanId(2),
            predicate: Expr::col("t.id").eq(Expr::lit_i64(7)),
            input: Box::new(scan(1, "t")),
        };
        let out = best(&plan, &[StorageEngine::Transactional]).unwrap();
        assert!(matches!(out, PhysicalPlan::PointGet(p) if p.index.is_none()));
    }

    #[test]
    fn join_commute_is_explored_once() {
        let plan = LogicalPlan::Join {
            id: PlanId(3),
            left: Box::new(scan(1, "t")),
            right: Box::new(scan(2, "s")),
            on: vec![("t.id".to_string(), "s.id".to_string())],
            strategy_hint: JoinStrategyHint::Auto,
        };
        let mut memo = Memo::new();
        let root = memo.insert_plan(&plan);
        memo.explore(&[&FilterIntoScan, &JoinCommute]);
        // original + commuted; commuting back is deduplicated
        assert_eq!(memo.group_exprs(root).len(), 2);

        let out = best(&plan, &[StorageEngine::Transactional]).unwrap();
        let PhysicalPlan::HashJoin(join) = out else {
            panic!("expected hash join");
        };
        assert_ne!(join.strategy, JoinStrategyHint::Shuffle);
    }

    #[test]
    fn explicit_shuffle_survives_commutation() {
        let plan = LogicalPlan::Join {
            id: PlanId(3),
            left: Box::new(scan(1, "t")),
            right: Box::new(scan(2, "s")),
            on: vec![("t.id".to_string(), "s.id".to_string())],
            strategy_hint: JoinStrategyHint::Shuffle,
        };
        let PhysicalPlan::HashJoin(join) = best(&plan, &[StorageEngine::Transactional]).unwrap()
        else {
            panic!("expected hash join");
        };
        assert_eq!(join.strategy, JoinStrategyHint::Shuffle);
    }

    #[test]
    fn group_without_implementation_is_no_plan_found() {
        let err = best(&scan(1, "t"), &[StorageEngine::AnalyticReplica]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPlanFound);
    }
}
