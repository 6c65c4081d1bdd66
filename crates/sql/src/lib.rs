//! SQL front door: parsing via `sqlparser`, the [`StmtNode`] wrapper that
//! distinguishes `EXECUTE` references from ordinary statements, and
//! structural statement classification.

mod node;
mod params;
mod readonly;

pub use node::{ExecuteStmt, StmtNode};
pub use params::{bind_placeholders, placeholder_count};
pub use readonly::is_read_only;
pub use sqlparser::ast;

use keel_common::{KeelError, Result};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| KeelError::PlanBuild(e.to_string()))
}

/// Parse exactly one statement and wrap it as a [`StmtNode`].
pub fn parse_one(sql: &str) -> Result<StmtNode> {
    let mut stmts = parse_sql(sql)?;
    if stmts.len() != 1 {
        return Err(KeelError::Unsupported(format!(
            "expected a single statement, got {}",
            stmts.len()
        )));
    }
    Ok(StmtNode::from(stmts.remove(0)))
}

#[cfg(test)]
mod tests {
    use super::{parse_one, parse_sql, StmtNode};

    #[test]
    fn parse_one_rejects_multiple_statements() {
        assert!(parse_one("SELECT 1; SELECT 2").is_err());
        assert_eq!(parse_sql("SELECT 1; SELECT 2").unwrap().len(), 2);
    }

    #[test]
    fn execute_text_becomes_execute_node() {
        let node = parse_one("EXECUTE get_user(5)").unwrap();
        match node {
            StmtNode::Execute(exec) => {
                assert_eq!(exec.name.as_deref(), Some("get_user"));
                assert_eq!(exec.args.len(), 1);
            }
            other => panic!("expected execute node, got {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_surface_as_plan_build_errors() {
        let err = parse_sql("SELEC 1").unwrap_err();
        assert_eq!(err.kind(), keel_common::ErrorKind::PlanBuild);
    }
}
