//! Point access recognition.
//!
//! Statements addressing rows by a fully specified primary key or unique
//! index skip building and optimization altogether. Anything the matcher
//! does not recognise returns `Ok(None)` and goes down the general path.

use std::collections::{BTreeMap, BTreeSet};

use keel_common::{Result, StorageEngine};
use keel_sql::ast::{
    AssignmentTarget, BinaryOperator, Delete, Expr as SqlExpr, FromTable, GroupByExpr, LockType,
    Query, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use keel_sql::StmtNode;
use keel_storage::{SchemaSnapshot, TableDef};
use tracing::debug;

use crate::builder::{resolve_table_name, value_to_expr};
use crate::logical_plan::{Expr, PlanColumn};
use crate::plan::{BatchPointGetPlan, FastPlan, IdAllocator, IndexAccess, PointGetPlan};
use crate::privilege::{check_privilege, Privilege, PrivilegeManager, RoleIdentity, VisitRecord};

/// What the matcher needs from the session.
#[derive(Clone, Copy)]
pub struct FastPlanContext<'a> {
    pub snapshot: &'a SchemaSnapshot,
    pub current_db: &'a str,
    pub engines: &'a BTreeSet<StorageEngine>,
    /// Authorization for the matched plan; `None` skips the check.
    pub privileges: Option<(&'a dyn PrivilegeManager, &'a [RoleIdentity])>,
}

/// Try to plan `node` as a point access.
///
/// Fails only when the statement matched but authorization did not pass.
pub fn try_fast_plan(
    ctx: &FastPlanContext<'_>,
    ids: &mut IdAllocator,
    node: &StmtNode,
) -> Result<Option<FastPlan>> {
    if !ctx.engines.contains(&StorageEngine::Transactional) {
        return Ok(None);
    }
    let Some(stmt) = node.statement() else {
        return Ok(None);
    };
    let matched = match stmt {
        Statement::Query(q) => match_select(ctx, ids, q),
        Statement::Update {
            table,
            assignments,
            from: None,
            selection: Some(selection),
            returning: None,
            ..
        } => match_update(ctx, ids, table, assignments, selection),
        Statement::Delete(delete) => match_delete(ctx, ids, delete),
        _ => None,
    };
    let Some(plan) = matched else {
        return Ok(None);
    };
    if let Some((pm, roles)) = ctx.privileges {
        check_privilege(roles, pm, &visit_records(&plan))?;
    }
    let (db, table) = plan.db_table();
    debug!(operator = "FastPlan", db, table, pure_pk = plan.is_pure_primary_key_get(), "matched point access");
    Ok(Some(plan))
}

/// Privileges a fast plan needs, in visit order.
pub fn visit_records(plan: &FastPlan) -> Vec<VisitRecord> {
    let (db, table) = plan.db_table();
    match plan {
        FastPlan::PointGet(_) | FastPlan::BatchPointGet(_) => {
            vec![VisitRecord::table(Privilege::Select, db, table)]
        }
        FastPlan::Update { assignments, .. } => {
            let mut out = assignments
                .iter()
                .map(|(c, _)| VisitRecord::table(Privilege::Update, db, table).with_column(c))
                .collect::<Vec<_>>();
            out.push(VisitRecord::table(Privilege::Select, db, table));
            out
        }
        FastPlan::Delete { .. } => vec![
            VisitRecord::table(Privilege::Delete, db, table),
            VisitRecord::table(Privilege::Select, db, table),
        ],
    }
}

/// Single hint-free table with no joins.
fn single_table<'a>(
    ctx: &FastPlanContext<'a>,
    twj: &TableWithJoins,
) -> Option<(&'a TableDef, String)> {
    if !twj.joins.is_empty() {
        return None;
    }
    let TableFactor::Table {
        name,
        alias,
        args: None,
        with_hints,
        ..
    } = &twj.relation
    else {
        return None;
    };
    if !with_hints.is_empty() {
        return None;
    }
    let (db, table) = resolve_table_name(name, ctx.current_db).ok()?;
    let def = ctx.snapshot.try_table(&db, &table)?;
    let qualifier = alias
        .as_ref()
        .map(|a| a.name.value.clone())
        .unwrap_or_else(|| def.name.clone());
    Some((def, qualifier))
}

fn match_select(ctx: &FastPlanContext<'_>, ids: &mut IdAllocator, q: &Query) -> Option<FastPlan> {
    if q.with.is_some()
        || q.order_by.is_some()
        || q.limit.is_some()
        || q.offset.is_some()
        || q.fetch.is_some()
    {
        return None;
    }
    let lock = match q.locks.as_slice() {
        [] => false,
        [one] if one.lock_type == LockType::Update => true,
        _ => return None,
    };
    let SetExpr::Select(select) = q.body.as_ref() else {
        return None;
    };
    let plain_group = matches!(&select.group_by, GroupByExpr::Expressions(v, _) if v.is_empty());
    if select.distinct.is_some()
        || select.into.is_some()
        || select.having.is_some()
        || !plain_group
        || select.from.len() != 1
    {
        return None;
    }
    let (def, qualifier) = single_table(ctx, &select.from[0])?;
    let columns = output_columns(ids, def, &qualifier, &select.projection)?;
    let conditions = point_conditions(select.selection.as_ref()?, def, &qualifier)?;

    if let Conditions::In { column, values } = &conditions {
        if def.primary_key.len() == 1 && def.primary_key[0].eq_ignore_ascii_case(column) {
            return Some(FastPlan::BatchPointGet(BatchPointGetPlan {
                id: ids.next_plan_id(),
                db: def.db.clone(),
                table: def.name.clone(),
                table_id: def.id,
                key_column: def.primary_key[0].clone(),
                keys: values.clone(),
                columns,
                lock,
            }));
        }
        return None;
    }
    point_get(ids, def, &conditions, columns, lock).map(FastPlan::PointGet)
}

fn match_update(
    ctx: &FastPlanContext<'_>,
    ids: &mut IdAllocator,
    table: &TableWithJoins,
    assignments: &[keel_sql::ast::Assignment],
    selection: &SqlExpr,
) -> Option<FastPlan> {
    let (def, qualifier) = single_table(ctx, table)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return None;
        };
        let col = column_ref(&name.0, def, &qualifier)?;
        let SqlExpr::Value(v) = &a.value else {
            return None;
        };
        sets.push((col, value_to_expr(v).ok()?));
    }
    let conditions = point_conditions(selection, def, &qualifier)?;
    let point = point_get(ids, def, &conditions, vec![], true)?;
    Some(FastPlan::Update {
        id: ids.next_plan_id(),
        point,
        assignments: sets,
    })
}

fn match_delete(ctx: &FastPlanContext<'_>, ids: &mut IdAllocator, delete: &Delete) -> Option<FastPlan> {
    if !delete.tables.is_empty()
        || delete.using.is_some()
        || delete.returning.is_some()
        || !delete.order_by.is_empty()
        || delete.limit.is_some()
    {
        return None;
    }
    let from = match &delete.from {
        FromTable::WithFromKeyword(v) | FromTable::WithoutKeyword(v) => v,
    };
    let [twj] = from.as_slice() else {
        return None;
    };
    let (def, qualifier) = single_table(ctx, twj)?;
    let conditions = point_conditions(delete.selection.as_ref()?, def, &qualifier)?;
    let point = point_get(ids, def, &conditions, vec![], true)?;
    Some(FastPlan::Delete {
        id: ids.next_plan_id(),
        point,
    })
}

/// `*` or a list of (optionally aliased) plain columns.
fn output_columns(
    ids: &mut IdAllocator,
    def: &TableDef,
    qualifier: &str,
    items: &[SelectItem],
) -> Option<Vec<PlanColumn>> {
    let mut out = vec![];
    for item in items {
        let (expr, alias) = match item {
            SelectItem::Wildcard(_) => {
                for c in &def.columns {
                    out.push(PlanColumn {
                        id: ids.next_column_id(),
                        name: c.name.clone(),
                        data_type: c.data_type.clone(),
                    });
                }
                continue;
            }
            SelectItem::UnnamedExpr(e) => (e, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
            SelectItem::QualifiedWildcard(..) => return None,
        };
        let parts = match expr {
            SqlExpr::Identifier(i) => std::slice::from_ref(i),
            SqlExpr::CompoundIdentifier(parts) => parts.as_slice(),
            _ => return None,
        };
        let name = column_ref(parts, def, qualifier)?;
        let data_type = def.column(&name)?.data_type.clone();
        out.push(PlanColumn {
            id: ids.next_column_id(),
            name: alias.unwrap_or(name),
            data_type,
        });
    }
    (!out.is_empty()).then_some(out)
}

/// Table column referenced by `col` or `qualifier.col`.
fn column_ref(parts: &[keel_sql::ast::Ident], def: &TableDef, qualifier: &str) -> Option<String> {
    let col = match parts {
        [c] => c,
        [q, c] if q.value.eq_ignore_ascii_case(qualifier) => c,
        _ => return None,
    };
    def.column(&col.value).map(|c| c.name.clone())
}

enum Conditions {
    /// Column to value, keyed by canonical column name.
    Eq(BTreeMap<String, Expr>),
    In { column: String, values: Vec<Expr> },
}

/// `c1 = v1 AND c2 = v2 ...` or a lone `c IN (v, ...)`, values being
/// literals or placeholders.
fn point_conditions(e: &SqlExpr, def: &TableDef, qualifier: &str) -> Option<Conditions> {
    if let SqlExpr::InList {
        expr,
        list,
        negated: false,
    } = e
    {
        let column = column_of(expr, def, qualifier)?;
        let values = list
            .iter()
            .map(|v| match v {
                SqlExpr::Value(v) => value_to_expr(v).ok(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        return (!values.is_empty()).then_some(Conditions::In { column, values });
    }
    let mut eqs = BTreeMap::new();
    let mut stack = vec![e];
    while let Some(e) = stack.pop() {
        match e {
            SqlExpr::Nested(inner) => stack.push(inner),
            SqlExpr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                stack.push(right);
                stack.push(left);
            }
            SqlExpr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                let (col, v) = match (left.as_ref(), right.as_ref()) {
                    (c, SqlExpr::Value(v)) | (SqlExpr::Value(v), c) => (column_of(c, def, qualifier)?, v),
                    _ => return None,
                };
                let v = value_to_expr(v).ok()?;
                if eqs.insert(col.to_ascii_lowercase(), v).is_some() {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(Conditions::Eq(eqs))
}

fn column_of(e: &SqlExpr, def: &TableDef, qualifier: &str) -> Option<String> {
    match e {
        SqlExpr::Identifier(i) => column_ref(std::slice::from_ref(i), def, qualifier),
        SqlExpr::CompoundIdentifier(parts) => column_ref(parts, def, qualifier),
        SqlExpr::Nested(inner) => column_of(inner, def, qualifier),
        _ => None,
    }
}

/// Point access when the equalities cover exactly the primary key or all
/// columns of one unique index.
fn point_get(
    ids: &mut IdAllocator,
    def: &TableDef,
    conditions: &Conditions,
    columns: Vec<PlanColumn>,
    lock: bool,
) -> Option<PointGetPlan> {
    let Conditions::Eq(eqs) = conditions else {
        return None;
    };
    let covers = |key: &[String]| {
        key.len() == eqs.len() && key.iter().all(|c| eqs.contains_key(&c.to_ascii_lowercase()))
    };
    let key_of = |key: &[String]| {
        key.iter()
            .map(|c| (c.clone(), eqs[&c.to_ascii_lowercase()].clone()))
            .collect::<Vec<_>>()
    };
    let (index, key) = if !def.primary_key.is_empty() && covers(&def.primary_key) {
        (None, key_of(&def.primary_key))
    } else {
        let index = def.indexes.iter().find(|i| i.unique && covers(&i.columns))?;
        (
            Some(IndexAccess {
                id: index.id,
                name: index.name.clone(),
            }),
            key_of(&index.columns),
        )
    };
    Some(PointGetPlan {
        id: ids.next_plan_id(),
        db: def.db.clone(),
        table: def.name.clone(),
        table_id: def.id,
        index,
        key,
        columns,
        lock,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use arrow_schema::DataType;
    use keel_common::{ErrorKind, StorageEngine};
    use keel_sql::parse_one;
    use keel_storage::{Catalog, SchemaSnapshot, TableDef};

    use super::{try_fast_plan, FastPlanContext};
    use crate::plan::{FastPlan, IdAllocator};
    use crate::privilege::{GrantTable, Privilege, PrivilegeManager, RoleIdentity};

    fn snapshot() -> SchemaSnapshot {
        let mut cat = Catalog::new();
        cat.register_table(
            TableDef::new(1, "main", "t")
                .with_column("id", DataType::Int64)
                .with_column("email", DataType::Utf8)
                .with_column("a", DataType::Int64)
                .with_primary_key(&["id"])
                .with_index("uk_email", &["email"], true)
                .with_index("idx_a", &["a"], false),
        )
        .unwrap();
        cat.snapshot()
    }

    fn fast(sql: &str) -> Option<FastPlan> {
        let snap = snapshot();
        let engines = BTreeSet::from([StorageEngine::Transactional]);
        let ctx = FastPlanContext {
            snapshot: &snap,
            current_db: "main",
            engines: &engines,
            privileges: None,
        };
        try_fast_plan(&ctx, &mut IdAllocator::new(), &parse_one(sql).unwrap()).unwrap()
    }

    #[test]
    fn primary_key_equality_is_point_get() {
        let Some(FastPlan::PointGet(p)) = fast("SELECT a FROM t WHERE id = 1") else {
            panic!("expected point get");
        };
        assert!(p.index.is_none());
        assert!(!p.lock);
        assert_eq!(p.columns[0].name, "a");
    }

    #[test]
    fn unique_index_and_for_update() {
        let Some(FastPlan::PointGet(p)) =
            fast("SELECT * FROM t WHERE email = 'x@y' FOR UPDATE")
        else {
            panic!("expected point get");
        };
        assert_eq!(p.index.as_ref().map(|i| i.name.as_str()), Some("uk_email"));
        assert!(p.lock);
        assert_eq!(p.columns.len(), 3);
    }

    #[test]
    fn placeholders_are_accepted() {
        assert!(matches!(fast("SELECT id FROM t WHERE id = ?"), Some(FastPlan::PointGet(_))));
    }

    #[test]
    fn in_list_on_primary_key_is_batch() {
        let Some(FastPlan::BatchPointGet(b)) = fast("SELECT * FROM t WHERE id IN (1, 2, 3)") else {
            panic!("expected batch point get");
        };
        assert_eq!(b.keys.len(), 3);
    }

    #[test]
    fn point_update_and_delete() {
        assert!(matches!(
            fast("UPDATE t SET a = 5 WHERE id = 2"),
            Some(FastPlan::Update { point, .. }) if point.lock
        ));
        assert!(matches!(
            fast("DELETE FROM t WHERE id = 2"),
            Some(FastPlan::Delete { .. })
        ));
    }

    #[test]
    fn non_point_statements_fall_through() {
        assert!(fast("SELECT * FROM t WHERE a = 1").is_none());
        assert!(fast("SELECT * FROM t WHERE id = 1 AND a = 2").is_none());
        assert!(fast("SELECT * FROM t WHERE id > 1").is_none());
        assert!(fast("SELECT * FROM t WHERE id = 1 LIMIT 1").is_none());
        assert!(fast("SELECT * FROM t WITH (use_index(idx_a)) WHERE id = 1").is_none());
        assert!(fast("SELECT COUNT(1) FROM t WHERE id = 1").is_none());
    }

    #[test]
    fn requires_transactional_engine() {
        let snap = snapshot();
        let engines = BTreeSet::from([StorageEngine::AnalyticReplica]);
        let ctx = FastPlanContext {
            snapshot: &snap,
            current_db: "main",
            engines: &engines,
            privileges: None,
        };
        let node = parse_one("SELECT * FROM t WHERE id = 1").unwrap();
        assert!(try_fast_plan(&ctx, &mut IdAllocator::new(), &node).unwrap().is_none());
    }

    #[test]
    fn matched_plan_is_authorized() {
        let snap = snapshot();
        let engines = BTreeSet::from([StorageEngine::Transactional]);
        let grants = GrantTable::new();
        let role = RoleIdentity::new("app", "%");
        let roles = [role.clone()];
        let pm: &dyn PrivilegeManager = &grants;
        let ctx = FastPlanContext {
            snapshot: &snap,
            current_db: "main",
            engines: &engines,
            privileges: Some((pm, &roles[..])),
        };
        let node = parse_one("SELECT * FROM t WHERE id = 1").unwrap();
        let err = try_fast_plan(&ctx, &mut IdAllocator::new(), &node).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrivilegeDenied);

        grants.grant(&role, Privilege::Select, "main", "t");
        assert!(try_fast_plan(&ctx, &mut IdAllocator::new(), &node).unwrap().is_some());
    }
}
