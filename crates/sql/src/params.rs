use std::ops::ControlFlow;

use keel_common::{KeelError, Result};
use sqlparser::ast::{visit_expressions, visit_expressions_mut, Expr, Statement, Value};

/// Number of parameters a statement expects.
///
/// Anonymous `?` placeholders count one each; numbered `$n` placeholders
/// count up to the highest `n`.
pub fn placeholder_count(stmt: &Statement) -> usize {
    let mut anonymous = 0usize;
    let mut numbered = 0usize;
    let _ = visit_expressions(stmt, |expr| {
        if let Expr::Value(Value::Placeholder(p)) = expr {
            match numbered_position(p) {
                Some(n) => numbered = numbered.max(n),
                None => anonymous += 1,
            }
        }
        ControlFlow::<()>::Continue(())
    });
    anonymous.max(numbered)
}

/// Replace placeholders in `stmt` with `args`, positionally.
pub fn bind_placeholders(stmt: &mut Statement, args: &[Expr]) -> Result<()> {
    let mut next = 0usize;
    let flow = visit_expressions_mut(stmt, |expr| {
        let Expr::Value(Value::Placeholder(p)) = expr else {
            return ControlFlow::Continue(());
        };
        let position = match numbered_position(p) {
            Some(n) => n - 1,
            None => {
                next += 1;
                next - 1
            }
        };
        match args.get(position) {
            Some(arg) => {
                *expr = arg.clone();
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(KeelError::PlanBuild(format!(
                "missing argument for placeholder {p} (got {} arguments)",
                args.len()
            ))),
        }
    });
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(e) => Err(e),
    }
}

fn numbered_position(p: &str) -> Option<usize> {
    p.strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::{bind_placeholders, placeholder_count};
    use crate::parse_sql;
    use sqlparser::ast::{Expr, Value};

    #[test]
    fn counts_anonymous_and_numbered_placeholders() {
        let stmts = parse_sql("SELECT a FROM t WHERE b = ? AND c = ?").unwrap();
        assert_eq!(placeholder_count(&stmts[0]), 2);
        let stmts = parse_sql("SELECT a FROM t WHERE b = $2 OR c = $1").unwrap();
        assert_eq!(placeholder_count(&stmts[0]), 2);
    }

    #[test]
    fn binds_in_order() {
        let mut stmt = parse_sql("SELECT a FROM t WHERE b = ? AND c = ?")
            .unwrap()
            .remove(0);
        let args = vec![
            Expr::Value(Value::Number("5".to_string(), false)),
            Expr::Value(Value::SingleQuotedString("x".to_string())),
        ];
        bind_placeholders(&mut stmt, &args).unwrap();
        assert_eq!(stmt.to_string(), "SELECT a FROM t WHERE b = 5 AND c = 'x'");
    }

    #[test]
    fn missing_argument_is_a_build_error() {
        let mut stmt = parse_sql("SELECT a FROM t WHERE b = ?").unwrap().remove(0);
        assert!(bind_placeholders(&mut stmt, &[]).is_err());
    }
}
