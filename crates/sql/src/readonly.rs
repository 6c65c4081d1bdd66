use std::ops::ControlFlow;

use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, Visit, Visitor};

/// Functions with side effects that make an otherwise plain query a writer.
const SIDE_EFFECT_FUNCTIONS: &[&str] = &[
    "get_lock",
    "release_lock",
    "release_all_locks",
    "nextval",
    "setval",
];

/// Whether a statement performs no mutation.
///
/// This is a structural property of the statement: it never consults the
/// catalog. Queries are read-only unless they take row locks
/// (`FOR UPDATE`/`FOR SHARE`), materialize into a table (`SELECT ... INTO`)
/// or call a side-effecting function anywhere in the tree.
pub fn is_read_only(stmt: &Statement) -> bool {
    match stmt {
        Statement::Query(q) => query_is_read_only(q),
        Statement::Explain {
            analyze, statement, ..
        } => !*analyze || is_read_only(statement),
        Statement::ExplainTable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowCollation { .. } => true,
        _ => false,
    }
}

fn query_is_read_only(q: &Query) -> bool {
    let mut checker = ReadOnlyChecker;
    q.visit(&mut checker).is_continue()
}

struct ReadOnlyChecker;

impl Visitor for ReadOnlyChecker {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break(());
        }
        if let SetExpr::Select(select) = query.body.as_ref() {
            if select.into.is_some() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(func) = expr {
            if is_side_effect_function(&func.name) {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

fn is_side_effect_function(name: &ObjectName) -> bool {
    name.0
        .last()
        .map(|ident| ident.value.to_ascii_lowercase())
        .is_some_and(|n| SIDE_EFFECT_FUNCTIONS.contains(&n.as_str()))
}

#[cfg(test)]
mod tests {
    use super::is_read_only;
    use crate::parse_sql;

    fn classify(sql: &str) -> bool {
        let stmts = parse_sql(sql).unwrap();
        is_read_only(&stmts[0])
    }

    #[test]
    fn plain_queries_are_read_only() {
        assert!(classify("SELECT a FROM t WHERE b = 1"));
        assert!(classify("SELECT * FROM t JOIN s ON t.a = s.a"));
        assert!(classify("SHOW TABLES"));
        assert!(classify("EXPLAIN SELECT 1"));
    }

    #[test]
    fn locking_and_side_effects_are_writes() {
        assert!(!classify("SELECT a FROM t WHERE b = 1 FOR UPDATE"));
        assert!(!classify("SELECT get_lock('x', 10)"));
        assert!(!classify(
            "SELECT a FROM t WHERE b IN (SELECT c FROM s FOR UPDATE)"
        ));
    }

    #[test]
    fn dml_ddl_and_control_are_not_read_only() {
        assert!(!classify("UPDATE t SET x = 1"));
        assert!(!classify("INSERT INTO t VALUES (1)"));
        assert!(!classify("DELETE FROM t WHERE a = 1"));
        assert!(!classify("CREATE TABLE x (a INT)"));
        assert!(!classify("SET autocommit = 0"));
        assert!(!classify("EXPLAIN ANALYZE UPDATE t SET x = 1"));
    }
}
