use keel_common::{KeelError, Result, StatementId};
use keel_sql::{ExecuteStmt, StmtNode};
use tracing::error;

use crate::session::{PreparedStatement, SessionVars};

/// Resolve an `EXECUTE` reference. A name, when present, wins over the
/// numeric handle.
pub fn get_prepared_stmt<'v>(exec: &ExecuteStmt, vars: &'v SessionVars) -> Result<&'v PreparedStatement> {
    resolve_prepared(exec, vars).map(|(_, p)| p)
}

pub(crate) fn resolve_prepared<'v>(
    exec: &ExecuteStmt,
    vars: &'v SessionVars,
) -> Result<(StatementId, &'v PreparedStatement)> {
    let id = match &exec.name {
        Some(name) => *vars
            .prepared_stmt_name_to_id
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| KeelError::StatementNotFound(name.clone()))?,
        None => exec.id,
    };
    let stmt = vars
        .prepared_stmts
        .get(&id)
        .ok_or_else(|| KeelError::StatementNotFound(format!("statement id {id}")))?;
    Ok((id, stmt))
}

/// Whether `node` performs no mutation. An `EXECUTE` whose statement cannot
/// be resolved counts as a writer.
pub fn is_read_only(node: &StmtNode, vars: &SessionVars) -> bool {
    match node {
        StmtNode::Execute(exec) => match get_prepared_stmt(exec, vars) {
            Ok(prepared) => keel_sql::is_read_only(&prepared.statement),
            Err(e) => {
                error!(
                    operator = "ReadOnlyClassifier",
                    statement = %exec,
                    error = %e,
                    "can not resolve prepared statement, treating it as not read-only"
                );
                false
            }
        },
        StmtNode::Other(stmt) => keel_sql::is_read_only(stmt),
    }
}
