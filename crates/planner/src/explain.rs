use crate::logical_plan::{JoinStrategyHint, LogicalPlan};
use crate::physical_plan::{ExchangeExec, PartitioningSpec, PhysicalPlan};
use crate::plan::{FastPlan, Plan, PointGetPlan};

/// Render any plan as human-readable multiline text.
pub fn explain(plan: &Plan) -> String {
    match plan {
        Plan::Fast(f) => explain_fast(f),
        Plan::Logical(l) => explain_logical(l),
        Plan::Physical(p) => explain_physical(p),
        Plan::NonLogical(n) => format!("{:?} {}\n", n.kind, n.statement),
        Plan::Execute(e) => {
            let mut s = format!("Execute {}\n", e.stmt);
            if let Some(inner) = &e.plan {
                for line in explain(inner).lines() {
                    s.push_str(&format!("  {line}\n"));
                }
            }
            s
        }
    }
}

/// Render logical plan as human-readable multiline text.
pub fn explain_logical(plan: &LogicalPlan) -> String {
    let mut s = String::new();
    fmt_logical(plan, 0, &mut s);
    s
}

fn fmt_logical(plan: &LogicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    let id = plan.id();
    match plan {
        LogicalPlan::TableScan {
            db,
            table,
            qualifier,
            projection,
            filters,
            hints,
            ..
        } => {
            out.push_str(&format!("{pad}TableScan#{id} table={db}.{table} as {qualifier}\n"));
            out.push_str(&format!("{pad}  projection={:?}\n", projection));
            out.push_str(&format!("{pad}  pushed_filters={}\n", filters.len()));
            for f in filters {
                out.push_str(&format!("{pad}    {f}\n"));
            }
            if !hints.is_empty() {
                out.push_str(&format!("{pad}  hints={hints:?}\n"));
            }
        }
        LogicalPlan::Values { columns, rows, .. } => {
            out.push_str(&format!(
                "{pad}Values#{id} columns={} rows={}\n",
                columns.len(),
                rows.len()
            ));
        }
        LogicalPlan::Filter {
            predicate, input, ..
        } => {
            out.push_str(&format!("{pad}Filter#{id} {predicate}\n"));
            fmt_logical(input, indent + 1, out);
        }
        LogicalPlan::Projection { exprs, input, .. } => {
            out.push_str(&format!("{pad}Projection#{id}\n"));
            for (e, col) in exprs {
                out.push_str(&format!("{pad}  {} := {e}\n", col.name));
            }
            fmt_logical(input, indent + 1, out);
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
            ..
        } => {
            out.push_str(&format!("{pad}Aggregate#{id}\n"));
            out.push_str(&format!("{pad}  group_by={}\n", group_exprs.len()));
            for g in group_exprs {
                out.push_str(&format!("{pad}    {g}\n"));
            }
            out.push_str(&format!("{pad}  aggs={}\n", aggr_exprs.len()));
            for (a, col) in aggr_exprs {
                out.push_str(&format!("{pad}    {} := {a}\n", col.name));
            }
            fmt_logical(input, indent + 1, out);
        }
        LogicalPlan::Join {
            on,
            strategy_hint,
            left,
            right,
            ..
        } => {
            out.push_str(&format!(
                "{pad}Join#{id} strategy={}\n",
                fmt_join_hint(*strategy_hint)
            ));
            out.push_str(&format!("{pad}  on={:?}\n", on));
            out.push_str(&format!("{pad}  left:\n"));
            fmt_logical(left, indent + 2, out);
            out.push_str(&format!("{pad}  right:\n"));
            fmt_logical(right, indent + 2, out);
        }
        LogicalPlan::Limit { n, input, .. } => {
            out.push_str(&format!("{pad}Limit#{id} n={n}\n"));
            fmt_logical(input, indent + 1, out);
        }
        LogicalPlan::Insert {
            db,
            table,
            columns,
            on_duplicate,
            input,
            ..
        } => {
            out.push_str(&format!(
                "{pad}Insert#{id} table={db}.{table} columns={columns:?}\n"
            ));
            for (c, e) in on_duplicate {
                out.push_str(&format!("{pad}  on_duplicate {c} := {e}\n"));
            }
            fmt_logical(input, indent + 1, out);
        }
        LogicalPlan::Update {
            db,
            table,
            assignments,
            input,
            ..
        } => {
            out.push_str(&format!("{pad}Update#{id} table={db}.{table}\n"));
            for (c, e) in assignments {
                out.push_str(&format!("{pad}  {c} := {e}\n"));
            }
            fmt_logical(input, indent + 1, out);
        }
        LogicalPlan::Delete {
            db, table, input, ..
        } => {
            out.push_str(&format!("{pad}Delete#{id} table={db}.{table}\n"));
            fmt_logical(input, indent + 1, out);
        }
    }
}

/// Render physical plan as human-readable multiline text.
pub fn explain_physical(plan: &PhysicalPlan) -> String {
    let mut s = String::new();
    fmt_physical(plan, 0, &mut s);
    s
}

fn fmt_physical(plan: &PhysicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        PhysicalPlan::TableScan(s) => {
            out.push_str(&format!(
                "{pad}TableScan table={}.{} engine={} projection={:?} filters={}\n",
                s.db,
                s.table,
                s.engine,
                s.projection,
                s.filters.len()
            ));
        }
        PhysicalPlan::IndexLookup(l) => {
            let key = l
                .key
                .iter()
                .map(|(c, v)| format!("{c}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(
                "{pad}IndexLookup table={}.{} index={} key=[{key}] filters={}\n",
                l.db,
                l.table,
                l.index.name,
                l.filters.len()
            ));
        }
        PhysicalPlan::PointGet(p) => out.push_str(&format!("{pad}{}\n", fmt_point_get(p))),
        PhysicalPlan::Values(v) => {
            out.push_str(&format!("{pad}Values rows={}\n", v.rows.len()));
        }
        PhysicalPlan::Filter(f) => {
            out.push_str(&format!("{pad}Filter {}\n", f.predicate));
            fmt_physical(&f.input, indent + 1, out);
        }
        PhysicalPlan::Project(p) => {
            out.push_str(&format!("{pad}Project\n"));
            for (e, name) in &p.exprs {
                out.push_str(&format!("{pad}  {name} := {e}\n"));
            }
            fmt_physical(&p.input, indent + 1, out);
        }
        PhysicalPlan::CoalesceBatches(c) => {
            out.push_str(&format!(
                "{pad}CoalesceBatches target_batch_rows={}\n",
                c.target_batch_rows
            ));
            fmt_physical(&c.input, indent + 1, out);
        }
        PhysicalPlan::PartialHashAggregate(a) => {
            out.push_str(&format!(
                "{pad}PartialHashAggregate group_by={} aggs={}\n",
                a.group_exprs.len(),
                a.aggr_exprs.len()
            ));
            fmt_physical(&a.input, indent + 1, out);
        }
        PhysicalPlan::FinalHashAggregate(a) => {
            out.push_str(&format!(
                "{pad}FinalHashAggregate group_by={} aggs={}\n",
                a.group_exprs.len(),
                a.aggr_exprs.len()
            ));
            for (agg, name) in &a.aggr_exprs {
                out.push_str(&format!("{pad}  {name} := {agg}\n"));
            }
            fmt_physical(&a.input, indent + 1, out);
        }
        PhysicalPlan::HashJoin(j) => {
            out.push_str(&format!(
                "{pad}HashJoin strategy={} build_side={:?}\n",
                fmt_join_hint(j.strategy),
                j.build_side
            ));
            out.push_str(&format!("{pad}  on={:?}\n", j.on));
            out.push_str(&format!("{pad}  left:\n"));
            fmt_physical(&j.left, indent + 2, out);
            out.push_str(&format!("{pad}  right:\n"));
            fmt_physical(&j.right, indent + 2, out);
        }
        PhysicalPlan::Exchange(x) => match x {
            ExchangeExec::ShuffleWrite(e) => {
                out.push_str(&format!(
                    "{pad}ShuffleWrite {}\n",
                    fmt_partitioning(&e.partitioning)
                ));
                fmt_physical(&e.input, indent + 1, out);
            }
            ExchangeExec::ShuffleRead(e) => {
                out.push_str(&format!(
                    "{pad}ShuffleRead {}\n",
                    fmt_partitioning(&e.partitioning)
                ));
                fmt_physical(&e.input, indent + 1, out);
            }
            ExchangeExec::Broadcast(e) => {
                out.push_str(&format!("{pad}Broadcast\n"));
                fmt_physical(&e.input, indent + 1, out);
            }
        },
        PhysicalPlan::Limit(l) => {
            out.push_str(&format!("{pad}Limit n={}\n", l.n));
            fmt_physical(&l.input, indent + 1, out);
        }
        PhysicalPlan::Insert(i) => {
            out.push_str(&format!(
                "{pad}Insert table={}.{} columns={:?}\n",
                i.db, i.table, i.columns
            ));
            fmt_physical(&i.input, indent + 1, out);
        }
        PhysicalPlan::Update(u) => {
            out.push_str(&format!(
                "{pad}Update table={}.{} assignments={}\n",
                u.db,
                u.table,
                u.assignments.len()
            ));
            fmt_physical(&u.input, indent + 1, out);
        }
        PhysicalPlan::Delete(d) => {
            out.push_str(&format!("{pad}Delete table={}.{}\n", d.db, d.table));
            fmt_physical(&d.input, indent + 1, out);
        }
    }
}

fn explain_fast(plan: &FastPlan) -> String {
    match plan {
        FastPlan::PointGet(p) => format!("{}\n", fmt_point_get(p)),
        FastPlan::BatchPointGet(b) => format!(
            "BatchPointGet table={}.{} {} in {} keys lock={}\n",
            b.db,
            b.table,
            b.key_column,
            b.keys.len(),
            b.lock
        ),
        FastPlan::Update {
            point, assignments, ..
        } => {
            let mut s = format!("PointUpdate assignments={}\n", assignments.len());
            s.push_str(&format!("  {}\n", fmt_point_get(point)));
            s
        }
        FastPlan::Delete { point, .. } => format!("PointDelete\n  {}\n", fmt_point_get(point)),
    }
}

fn fmt_point_get(p: &PointGetPlan) -> String {
    let key = p
        .key
        .iter()
        .map(|(c, v)| format!("{c}={v}"))
        .collect::<Vec<_>>()
        .join(", ");
    let index = p.index.as_ref().map(|i| i.name.as_str()).unwrap_or("PRIMARY");
    format!(
        "PointGet table={}.{} index={index} key=[{key}] lock={}",
        p.db, p.table, p.lock
    )
}

fn fmt_partitioning(p: &PartitioningSpec) -> String {
    match p {
        PartitioningSpec::HashKeys { keys, partitions } => {
            format!("hash({}) partitions={partitions}", keys.join(", "))
        }
        PartitioningSpec::Single => "single".to_string(),
    }
}

fn fmt_join_hint(h: JoinStrategyHint) -> &'static str {
    match h {
        JoinStrategyHint::Auto => "auto",
        JoinStrategyHint::BroadcastLeft => "broadcast_left",
        JoinStrategyHint::BroadcastRight => "broadcast_right",
        JoinStrategyHint::Shuffle => "shuffle",
    }
}
