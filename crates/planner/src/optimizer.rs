use std::collections::HashSet;
use std::convert::Infallible;

use keel_common::Result;
use keel_storage::SchemaSnapshot;
use tracing::debug;

use crate::logical_plan::{
    combine_conjuncts, expr_columns, split_conjuncts, AggExpr, BinaryOp, Expr, JoinStrategyHint,
    LiteralValue, LogicalPlan,
};
use crate::plan::OptFlags;

/// Configuration knobs for rule-based optimization.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    /// Max table byte size eligible for broadcast join hinting.
    pub broadcast_threshold_bytes: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            broadcast_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Provide table stats for join hinting.
pub trait OptimizerContext {
    /// Return `(bytes, rows)` estimates for a table.
    fn table_stats(&self, db: &str, table: &str) -> Result<(Option<u64>, Option<u64>)>;
}

impl OptimizerContext for SchemaSnapshot {
    fn table_stats(&self, db: &str, table: &str) -> Result<(Option<u64>, Option<u64>)> {
        let def = self.table(db, table)?;
        Ok((def.stats.bytes, def.stats.rows))
    }
}

/// Rule-based optimizer for logical plans.
///
/// Rewrites are applied only when the builder flagged them useful and their
/// correctness preconditions hold; otherwise the plan is left unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Optimizer;

impl Optimizer {
    pub fn new() -> Self {
        Self
    }

    /// Apply the rule pipeline to a logical plan.
    ///
    /// Pass order is fixed:
    /// 1. constant folding
    /// 2. filter merge
    /// 3. column pruning
    /// 4. predicate pushdown
    /// 5. join strategy hinting
    pub fn optimize(
        &self,
        plan: LogicalPlan,
        flags: OptFlags,
        ctx: &dyn OptimizerContext,
        cfg: OptimizerConfig,
    ) -> Result<LogicalPlan> {
        let mut plan = plan;
        if flags.constant_folding {
            plan = remove_true_filters(rewrite_plan_exprs(plan, &fold_constants_expr));
        }
        if flags.filter_merge {
            plan = merge_filters(plan);
        }
        if flags.column_pruning {
            plan = prune_columns(plan, None).0;
        }
        if flags.predicate_pushdown {
            plan = predicate_pushdown(plan);
        }
        if flags.join_hinting {
            plan = join_strategy_hint(plan, ctx, cfg)?;
        }
        debug!(operator = "Optimizer", ?flags, root = %plan.id(), "rule pipeline done");
        Ok(plan)
    }
}

// -----------------------------
// 1) Constant folding
// -----------------------------

pub(crate) fn fold_constants_expr(e: Expr) -> Expr {
    match e {
        Expr::Not(inner) => {
            let inner = fold_constants_expr(*inner);
            match inner {
                Expr::Literal(LiteralValue::Boolean(b)) => Expr::Literal(LiteralValue::Boolean(!b)),
                _ => Expr::Not(Box::new(inner)),
            }
        }
        Expr::And(a, b) => {
            let a = fold_constants_expr(*a);
            let b = fold_constants_expr(*b);
            match (&a, &b) {
                (Expr::Literal(LiteralValue::Boolean(false)), _)
                | (_, Expr::Literal(LiteralValue::Boolean(false))) => {
                    Expr::Literal(LiteralValue::Boolean(false))
                }
                (Expr::Literal(LiteralValue::Boolean(true)), _) => b,
                (_, Expr::Literal(LiteralValue::Boolean(true))) => a,
                _ => Expr::And(Box::new(a), Box::new(b)),
            }
        }
        Expr::Or(a, b) => {
            let a = fold_constants_expr(*a);
            let b = fold_constants_expr(*b);
            match (&a, &b) {
                (Expr::Literal(LiteralValue::Boolean(true)), _)
                | (_, Expr::Literal(LiteralValue::Boolean(true))) => {
                    Expr::Literal(LiteralValue::Boolean(true))
                }
                (Expr::Literal(LiteralValue::Boolean(false)), _) => b,
                (_, Expr::Literal(LiteralValue::Boolean(false))) => a,
                _ => Expr::Or(Box::new(a), Box::new(b)),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let l = fold_constants_expr(*left);
            let r = fold_constants_expr(*right);

            if let (Expr::Literal(lv), Expr::Literal(rv)) = (&l, &r) {
                if let Some(out) = eval_binary(lv.clone(), op, rv.clone()) {
                    return Expr::Literal(out);
                }
            }

            Expr::BinaryOp {
                left: Box::new(l),
                op,
                right: Box::new(r),
            }
        }
        Expr::IsNull(x) => match fold_constants_expr(*x) {
            Expr::Literal(v) => Expr::Literal(LiteralValue::Boolean(v == LiteralValue::Null)),
            x => Expr::IsNull(Box::new(x)),
        },
        Expr::IsNotNull(x) => match fold_constants_expr(*x) {
            Expr::Literal(v) => Expr::Literal(LiteralValue::Boolean(v != LiteralValue::Null)),
            x => Expr::IsNotNull(Box::new(x)),
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(fold_constants_expr(*expr)),
            list: list.into_iter().map(fold_constants_expr).collect(),
            negated,
        },
        other => other,
    }
}

fn eval_binary(l: LiteralValue, op: BinaryOp, r: LiteralValue) -> Option<LiteralValue> {
    use LiteralValue::*;
    match (l, op, r) {
        (Boolean(a), BinaryOp::Eq, Boolean(b)) => Some(Boolean(a == b)),
        (Boolean(a), BinaryOp::NotEq, Boolean(b)) => Some(Boolean(a != b)),

        (Int64(a), BinaryOp::Plus, Int64(b)) => a.checked_add(b).map(Int64),
        (Int64(a), BinaryOp::Minus, Int64(b)) => a.checked_sub(b).map(Int64),
        (Int64(a), BinaryOp::Multiply, Int64(b)) => a.checked_mul(b).map(Int64),
        (Int64(a), BinaryOp::Divide, Int64(b)) if b != 0 => a.checked_div(b).map(Int64),
        (Int64(a), BinaryOp::Eq, Int64(b)) => Some(Boolean(a == b)),
        (Int64(a), BinaryOp::NotEq, Int64(b)) => Some(Boolean(a != b)),
        (Int64(a), BinaryOp::Lt, Int64(b)) => Some(Boolean(a < b)),
        (Int64(a), BinaryOp::LtEq, Int64(b)) => Some(Boolean(a <= b)),
        (Int64(a), BinaryOp::Gt, Int64(b)) => Some(Boolean(a > b)),
        (Int64(a), BinaryOp::GtEq, Int64(b)) => Some(Boolean(a >= b)),

        (Float64(a), BinaryOp::Plus, Float64(b)) => Some(Float64(a + b)),
        (Float64(a), BinaryOp::Minus, Float64(b)) => Some(Float64(a - b)),
        (Float64(a), BinaryOp::Multiply, Float64(b)) => Some(Float64(a * b)),
        (Float64(a), BinaryOp::Divide, Float64(b)) if b != 0.0 => Some(Float64(a / b)),
        (Float64(a), BinaryOp::Eq, Float64(b)) => Some(Boolean(a == b)),
        (Float64(a), BinaryOp::NotEq, Float64(b)) => Some(Boolean(a != b)),
        (Float64(a), BinaryOp::Lt, Float64(b)) => Some(Boolean(a < b)),
        (Float64(a), BinaryOp::LtEq, Float64(b)) => Some(Boolean(a <= b)),
        (Float64(a), BinaryOp::Gt, Float64(b)) => Some(Boolean(a > b)),
        (Float64(a), BinaryOp::GtEq, Float64(b)) => Some(Boolean(a >= b)),

        (Utf8(a), BinaryOp::Eq, Utf8(b)) => Some(Boolean(a == b)),
        (Utf8(a), BinaryOp::NotEq, Utf8(b)) => Some(Boolean(a != b)),
        _ => None,
    }
}

/// `Filter(true, x)` => `x`.
fn remove_true_filters(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter {
            predicate: Expr::Literal(LiteralValue::Boolean(true)),
            input,
            ..
        } => remove_true_filters(*input),
        other => map_children(other, remove_true_filters),
    }
}

// -----------------------------
// 2) Filter merge
// -----------------------------

fn merge_filters(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter {
            id,
            predicate,
            input,
        } => {
            let input = merge_filters(*input);
            if let LogicalPlan::Filter {
                predicate: inner_pred,
                input: inner_input,
                ..
            } = input
            {
                // Filter(Filter(x)) => Filter(x) with merged predicate
                LogicalPlan::Filter {
                    id,
                    predicate: Expr::And(Box::new(inner_pred), Box::new(predicate)),
                    input: inner_input,
                }
            } else {
                LogicalPlan::Filter {
                    id,
                    predicate,
                    input: Box::new(input),
                }
            }
        }
        other => map_children(other, merge_filters),
    }
}

// -----------------------------
// 3) Column pruning
// -----------------------------

/// Push the set of columns the parent needs down to the scans. `None` means
/// the parent needs every column.
fn prune_columns(
    plan: LogicalPlan,
    required: Option<HashSet<String>>,
) -> (LogicalPlan, HashSet<String>) {
    match plan {
        LogicalPlan::Limit { id, n, input } => {
            let (new_in, req) = prune_columns(*input, required);
            (
                LogicalPlan::Limit {
                    id,
                    n,
                    input: Box::new(new_in),
                },
                req,
            )
        }
        LogicalPlan::Filter {
            id,
            predicate,
            input,
        } => {
            let mut req = required.unwrap_or_default();
            req.extend(expr_columns(&predicate));
            let (new_in, child_req) = prune_columns(*input, Some(req));
            (
                LogicalPlan::Filter {
                    id,
                    predicate,
                    input: Box::new(new_in),
                },
                child_req,
            )
        }
        LogicalPlan::Projection { id, exprs, input } => {
            let kept_exprs = match &required {
                Some(req) => exprs
                    .into_iter()
                    .filter(|(_, col)| req.contains(&col.name))
                    .collect::<Vec<_>>(),
                None => exprs,
            };
            let mut child_req = HashSet::new();
            for (e, _) in &kept_exprs {
                child_req.extend(expr_columns(e));
            }
            let (new_in, _) = prune_columns(*input, Some(child_req.clone()));
            (
                LogicalPlan::Projection {
                    id,
                    exprs: kept_exprs,
                    input: Box::new(new_in),
                },
                child_req,
            )
        }
        LogicalPlan::Aggregate {
            id,
            group_exprs,
            aggr_exprs,
            input,
        } => {
            let mut child_req = HashSet::new();
            for g in &group_exprs {
                child_req.extend(expr_columns(g));
            }
            for (agg, _) in &aggr_exprs {
                child_req.extend(agg_columns(agg));
            }
            let (new_in, _) = prune_columns(*input, Some(child_req.clone()));
            (
                LogicalPlan::Aggregate {
                    id,
                    group_exprs,
                    aggr_exprs,
                    input: Box::new(new_in),
                },
                child_req,
            )
        }
        LogicalPlan::Join {
            id,
            left,
            right,
            on,
            strategy_hint,
        } => {
            let left_cols = left.output_names().into_iter().collect::<HashSet<_>>();
            let right_cols = right.output_names().into_iter().collect::<HashSet<_>>();

            let mut req_left = HashSet::new();
            let mut req_right = HashSet::new();
            // join keys always required
            for (lk, rk) in &on {
                req_left.insert(lk.clone());
                req_right.insert(rk.clone());
            }
            match required {
                Some(req) => {
                    for c in req {
                        if left_cols.contains(&c) {
                            req_left.insert(c);
                        } else if right_cols.contains(&c) {
                            req_right.insert(c);
                        }
                    }
                }
                None => {
                    req_left.extend(left_cols);
                    req_right.extend(right_cols);
                }
            }
            let (new_l, _) = prune_columns(*left, Some(req_left));
            let (new_r, _) = prune_columns(*right, Some(req_right));
            (
                LogicalPlan::Join {
                    id,
                    left: Box::new(new_l),
                    right: Box::new(new_r),
                    on,
                    strategy_hint,
                },
                HashSet::new(),
            )
        }
        LogicalPlan::TableScan {
            id,
            db,
            table,
            qualifier,
            columns,
            projection,
            filters,
            hints,
        } => {
            let mut req = required.unwrap_or_default();
            for f in &filters {
                req.extend(expr_columns(f));
            }
            let projection = if req.is_empty() {
                // no restriction -> keep existing projection
                projection
            } else {
                // keep schema order
                Some(
                    columns
                        .iter()
                        .filter(|c| req.contains(&format!("{qualifier}.{}", c.name)))
                        .map(|c| c.name.clone())
                        .collect(),
                )
            };
            (
                LogicalPlan::TableScan {
                    id,
                    db,
                    table,
                    qualifier,
                    columns,
                    projection,
                    filters,
                    hints,
                },
                HashSet::new(),
            )
        }
        // Writes and constant rows need their input whole.
        other @ (LogicalPlan::Values { .. }
        | LogicalPlan::Insert { .. }
        | LogicalPlan::Update { .. }
        | LogicalPlan::Delete { .. }) => (
            map_children(other, |p| prune_columns(p, None).0),
            HashSet::new(),
        ),
    }
}

fn agg_columns(agg: &AggExpr) -> HashSet<String> {
    expr_columns(agg.arg()).into_iter().collect()
}

// -----------------------------
// 4) Predicate pushdown
// -----------------------------

fn predicate_pushdown(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter {
            id,
            predicate,
            input,
        } => {
            let input = predicate_pushdown(*input);
            match input {
                LogicalPlan::TableScan {
                    id: scan_id,
                    db,
                    table,
                    qualifier,
                    columns,
                    projection,
                    mut filters,
                    hints,
                } => {
                    filters.extend(split_conjuncts(predicate));
                    LogicalPlan::TableScan {
                        id: scan_id,
                        db,
                        table,
                        qualifier,
                        columns,
                        projection,
                        filters,
                        hints,
                    }
                }
                LogicalPlan::Join {
                    id: join_id,
                    left,
                    right,
                    on,
                    strategy_hint,
                } => {
                    let left_cols = left.output_names().into_iter().collect::<HashSet<_>>();
                    let right_cols = right.output_names().into_iter().collect::<HashSet<_>>();

                    let mut left_push = vec![];
                    let mut right_push = vec![];
                    let mut keep = vec![];
                    for c in split_conjuncts(predicate) {
                        let cols = expr_columns(&c);
                        let seen_l = cols.iter().any(|x| left_cols.contains(x));
                        let seen_r = cols.iter().any(|x| right_cols.contains(x));
                        if seen_l && !seen_r {
                            left_push.push(c);
                        } else if seen_r && !seen_l {
                            right_push.push(c);
                        } else {
                            keep.push(c);
                        }
                    }

                    let push = |side: Box<LogicalPlan>, preds: Vec<Expr>| {
                        if preds.is_empty() {
                            *side
                        } else {
                            predicate_pushdown(LogicalPlan::Filter {
                                id,
                                predicate: combine_conjuncts(preds),
                                input: side,
                            })
                        }
                    };
                    let join = LogicalPlan::Join {
                        id: join_id,
                        left: Box::new(push(left, left_push)),
                        right: Box::new(push(right, right_push)),
                        on,
                        strategy_hint,
                    };
                    if keep.is_empty() {
                        join
                    } else {
                        LogicalPlan::Filter {
                            id,
                            predicate: combine_conjuncts(keep),
                            input: Box::new(join),
                        }
                    }
                }
                other => LogicalPlan::Filter {
                    id,
                    predicate,
                    input: Box::new(other),
                },
            }
        }
        other => map_children(other, predicate_pushdown),
    }
}

// -----------------------------
// 5) Join strategy hint
// -----------------------------

fn join_strategy_hint(
    plan: LogicalPlan,
    ctx: &dyn OptimizerContext,
    cfg: OptimizerConfig,
) -> Result<LogicalPlan> {
    match plan {
        LogicalPlan::Join {
            id,
            left,
            right,
            on,
            strategy_hint,
        } => {
            let hint = if strategy_hint != JoinStrategyHint::Auto {
                // explicit hints win
                strategy_hint
            } else {
                let l_bytes = estimate_bytes(&left, ctx)?;
                let r_bytes = estimate_bytes(&right, ctx)?;
                match (l_bytes, r_bytes) {
                    (Some(lb), Some(rb)) if lb <= cfg.broadcast_threshold_bytes && lb <= rb => {
                        JoinStrategyHint::BroadcastLeft
                    }
                    (Some(lb), Some(rb)) if rb <= cfg.broadcast_threshold_bytes && rb < lb => {
                        JoinStrategyHint::BroadcastRight
                    }
                    _ => JoinStrategyHint::Shuffle,
                }
            };
            Ok(LogicalPlan::Join {
                id,
                left: Box::new(join_strategy_hint(*left, ctx, cfg)?),
                right: Box::new(join_strategy_hint(*right, ctx, cfg)?),
                on,
                strategy_hint: hint,
            })
        }
        other => try_map_children(other, |p| join_strategy_hint(p, ctx, cfg)),
    }
}

fn estimate_bytes(plan: &LogicalPlan, ctx: &dyn OptimizerContext) -> Result<Option<u64>> {
    match plan {
        LogicalPlan::TableScan { db, table, .. } => {
            let (bytes, rows) = ctx.table_stats(db, table)?;
            if let Some(b) = bytes {
                return Ok(Some(b));
            }
            // heuristic row size
            Ok(rows.map(|r| r.saturating_mul(100)))
        }
        LogicalPlan::Values { rows, .. } => Ok(Some(rows.len() as u64 * 100)),
        LogicalPlan::Filter { input, .. }
        | LogicalPlan::Projection { input, .. }
        | LogicalPlan::Aggregate { input, .. }
        | LogicalPlan::Limit { input, .. } => estimate_bytes(input, ctx),
        LogicalPlan::Join { .. }
        | LogicalPlan::Insert { .. }
        | LogicalPlan::Update { .. }
        | LogicalPlan::Delete { .. } => Ok(None),
    }
}

// -----------------------------
// Helpers
// -----------------------------

pub(crate) fn map_children(plan: LogicalPlan, f: impl Fn(LogicalPlan) -> LogicalPlan) -> LogicalPlan {
    match try_map_children(plan, |p| Ok::<_, Infallible>(f(p))) {
        Ok(p) => p,
        Err(never) => match never {},
    }
}

pub(crate) fn try_map_children<E>(
    plan: LogicalPlan,
    f: impl Fn(LogicalPlan) -> std::result::Result<LogicalPlan, E>,
) -> std::result::Result<LogicalPlan, E> {
    Ok(match plan {
        leaf @ (LogicalPlan::TableScan { .. } | LogicalPlan::Values { .. }) => leaf,
        LogicalPlan::Projection { id, exprs, input } => LogicalPlan::Projection {
            id,
            exprs,
            input: Box::new(f(*input)?),
        },
        LogicalPlan::Filter {
            id,
            predicate,
            input,
        } => LogicalPlan::Filter {
            id,
            predicate,
            input: Box::new(f(*input)?),
        },
        LogicalPlan::Join {
            id,
            left,
            right,
            on,
            strategy_hint,
        } => LogicalPlan::Join {
            id,
            left: Box::new(f(*left)?),
            right: Box::new(f(*right)?),
            on,
            strategy_hint,
        },
        LogicalPlan::Aggregate {
            id,
            group_exprs,
            aggr_exprs,
            input,
        } => LogicalPlan::Aggregate {
            id,
            group_exprs,
            aggr_exprs,
            input: Box::new(f(*input)?),
        },
        LogicalPlan::Limit { id, n, input } => LogicalPlan::Limit {
            id,
            n,
            input: Box::new(f(*input)?),
        },
        LogicalPlan::Insert {
            id,
            db,
            table,
            columns,
            on_duplicate,
            input,
        } => LogicalPlan::Insert {
            id,
            db,
            table,
            columns,
            on_duplicate,
            input: Box::new(f(*input)?),
        },
        LogicalPlan::Update {
            id,
            db,
            table,
            assignments,
            input,
        } => LogicalPlan::Update {
            id,
            db,
            table,
            assignments,
            input: Box::new(f(*input)?),
        },
        LogicalPlan::Delete {
            id,
            db,
            table,
            input,
        } => LogicalPlan::Delete {
            id,
            db,
            table,
            input: Box::new(f(*input)?),
        },
    })
}

fn rewrite_plan_exprs(plan: LogicalPlan, rewrite: &dyn Fn(Expr) -> Expr) -> LogicalPlan {
    let plan = map_children(plan, |p| rewrite_plan_exprs(p, rewrite));
    let assign = |v: Vec<(String, Expr)>| -> Vec<(String, Expr)> {
        v.into_iter().map(|(c, e)| (c, rewrite(e))).collect()
    };
    match plan {
        LogicalPlan::TableScan {
            id,
            db,
            table,
            qualifier,
            columns,
            projection,
            filters,
            hints,
        } => LogicalPlan::TableScan {
            id,
            db,
            table,
            qualifier,
            columns,
            projection,
            filters: filters.into_iter().map(rewrite).collect(),
            hints,
        },
        LogicalPlan::Values { id, columns, rows } => LogicalPlan::Values {
            id,
            columns,
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(rewrite).collect())
                .collect(),
        },
        LogicalPlan::Projection { id, exprs, input } => LogicalPlan::Projection {
            id,
            exprs: exprs.into_iter().map(|(e, c)| (rewrite(e), c)).collect(),
            input,
        },
        LogicalPlan::Filter {
            id,
            predicate,
            input,
        } => LogicalPlan::Filter {
            id,
            predicate: rewrite(predicate),
            input,
        },
        LogicalPlan::Insert {
            id,
            db,
            table,
            columns,
            on_duplicate,
            input,
        } => LogicalPlan::Insert {
            id,
            db,
            table,
            columns,
            on_duplicate: assign(on_duplicate),
            input,
        },
        LogicalPlan::Update {
            id,
            db,
            table,
            assignments,
            input,
        } => LogicalPlan::Update {
            id,
            db,
            table,
            assignments: assign(assignments),
            input,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use keel_common::{ColumnId, PlanId};

    use super::{fold_constants_expr, Optimizer, OptimizerConfig, OptimizerContext};
    use crate::hints::TableHints;
    use crate::logical_plan::{BinaryOp, Expr, JoinStrategyHint, LiteralValue, LogicalPlan, PlanColumn};
    use crate::plan::OptFlags;

    struct TestCtx;

    impl OptimizerContext for TestCtx {
        fn table_stats(
            &self,
            _db: &str,
            table: &str,
        ) -> keel_common::Result<(Option<u64>, Option<u64>)> {
            Ok(match table {
                "small" => (Some(1_000), Some(10)),
                _ => (Some(1 << 40), None),
            })
        }
    }

    fn scan(id: u32, table: &str, cols: &[&str]) -> LogicalPlan {
        LogicalPlan::TableScan {
            id: PlanId(id),
            db: "main".to_string(),
            table: table.to_string(),
            qualifier: table.to_string(),
            columns: cols
                .iter()
                .enumerate()
                .map(|(i, c)| PlanColumn {
                    id: ColumnId(i as u64 + 1),
                    name: c.to_string(),
                    data_type: DataType::Int64,
                })
                .collect(),
            projection: None,
            filters: vec![],
            hints: TableHints::default(),
        }
    }

    #[test]
    fn folds_arithmetic_and_boolean_identities() {
        let e = Expr::And(
            Box::new(Expr::Literal(LiteralValue::Boolean(true))),
            Box::new(Expr::BinaryOp {
                left: Box::new(Expr::col("t.a")),
                op: BinaryOp::Gt,
                right: Box::new(Expr::BinaryOp {
                    left: Box::new(Expr::lit_i64(2)),
                    op: BinaryOp::Plus,
                    right: Box::new(Expr::lit_i64(3)),
                }),
            }),
        );
        assert_eq!(
            fold_constants_expr(e),
            Expr::BinaryOp {
                left: Box::new(Expr::col("t.a")),
                op: BinaryOp::Gt,
                right: Box::new(Expr::lit_i64(5)),
            }
        );
        let overflow = Expr::BinaryOp {
            left: Box::new(Expr::lit_i64(i64::MAX)),
            op: BinaryOp::Plus,
            right: Box::new(Expr::lit_i64(1)),
        };
        assert_eq!(fold_constants_expr(overflow.clone()), overflow);
    }

    #[test]
    fn pushes_join_side_predicates_and_prunes_columns() {
        let plan = LogicalPlan::Projection {
            id: PlanId(10),
            exprs: vec![(
                Expr::col("big.b"),
                PlanColumn {
                    id: ColumnId(20),
                    name: "b".to_string(),
                    data_type: DataType::Int64,
                },
            )],
            input: Box::new(LogicalPlan::Filter {
                id: PlanId(9),
                predicate: Expr::And(
                    Box::new(Expr::col("small.x").eq(Expr::lit_i64(1))),
                    Box::new(Expr::col("big.c").eq(Expr::lit_i64(2))),
                ),
                input: Box::new(LogicalPlan::Join {
                    id: PlanId(3),
                    left: Box::new(scan(1, "big", &["k", "b", "c", "d"])),
                    right: Box::new(scan(2, "small", &["k", "x", "y"])),
                    on: vec![("big.k".to_string(), "small.k".to_string())],
                    strategy_hint: JoinStrategyHint::Auto,
                }),
            }),
        };
        let out = Optimizer::new()
            .optimize(plan, OptFlags::all(), &TestCtx, OptimizerConfig::default())
            .unwrap();

        let LogicalPlan::Projection { input, .. } = out else {
            panic!("expected projection root");
        };
        let LogicalPlan::Join {
            left,
            right,
            strategy_hint,
            ..
        } = *input
        else {
            panic!("filter should be fully pushed below the join");
        };
        assert_eq!(strategy_hint, JoinStrategyHint::BroadcastRight);
        match (*left, *right) {
            (
                LogicalPlan::TableScan {
                    projection: Some(lp),
                    filters: lf,
                    ..
                },
                LogicalPlan::TableScan {
                    projection: Some(rp),
                    filters: rf,
                    ..
                },
            ) => {
                assert_eq!(lp, vec!["k", "b", "c"]);
                assert_eq!(rp, vec!["k", "x"]);
                assert_eq!(lf.len(), 1);
                assert_eq!(rf.len(), 1);
            }
            other => panic!("unexpected join inputs: {other:?}"),
        }
    }

    #[test]
    fn explicit_join_hint_is_kept() {
        let plan = LogicalPlan::Join {
            id: PlanId(3),
            left: Box::new(scan(1, "big", &["k"])),
            right: Box::new(scan(2, "small", &["k"])),
            on: vec![("big.k".to_string(), "small.k".to_string())],
            strategy_hint: JoinStrategyHint::Shuffle,
        };
        let out = Optimizer::new()
            .optimize(plan, OptFlags::all(), &TestCtx, OptimizerConfig::default())
            .unwrap();
        assert!(matches!(
            out,
            LogicalPlan::Join {
                strategy_hint: JoinStrategyHint::Shuffle,
                ..
            }
        ));
    }

    #[test]
    fn unflagged_rules_do_not_run() {
        let plan = LogicalPlan::Filter {
            id: PlanId(2),
            predicate: Expr::col("t.a").eq(Expr::lit_i64(1)),
            input: Box::new(scan(1, "t", &["a"])),
        };
        let out = Optimizer::new()
            .optimize(plan.clone(), OptFlags::default(), &TestCtx, OptimizerConfig::default())
            .unwrap();
        assert_eq!(out, plan);
    }
}
