use std::fmt;

use keel_common::StatementId;
use sqlparser::ast::{Expr, Statement};

/// Reference to a previously prepared statement.
///
/// Text protocol `EXECUTE name ...` carries a name; binary protocol executes
/// carry only the numeric handle. When `name` is set it takes precedence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteStmt {
    /// Prepared statement name.
    pub name: Option<String>,
    /// Prepared statement handle, consulted when `name` is `None`.
    pub id: StatementId,
    /// Argument expressions bound to the statement's placeholders.
    pub args: Vec<Expr>,
}

impl ExecuteStmt {
    pub fn by_name(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: Some(name.into()),
            id: StatementId(0),
            args,
        }
    }

    pub fn by_id(id: StatementId, args: Vec<Expr>) -> Self {
        Self {
            name: None,
            id,
            args,
        }
    }
}

impl fmt::Display for ExecuteStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "EXECUTE {name}")?,
            None => write!(f, "EXECUTE #{}", self.id)?,
        }
        if !self.args.is_empty() {
            let args = self
                .args
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " USING {args}")?;
        }
        Ok(())
    }
}

/// A parsed statement as seen by the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtNode {
    /// Reference to a prepared statement.
    Execute(ExecuteStmt),
    /// Any other statement.
    Other(Statement),
}

impl StmtNode {
    /// Underlying statement, `None` for execute references.
    pub fn statement(&self) -> Option<&Statement> {
        match self {
            StmtNode::Execute(_) => None,
            StmtNode::Other(stmt) => Some(stmt),
        }
    }
}

impl From<Statement> for StmtNode {
    fn from(stmt: Statement) -> Self {
        match stmt {
            Statement::Execute {
                name,
                parameters,
                using,
                ..
            } => {
                let args = if parameters.is_empty() {
                    using
                } else {
                    parameters
                };
                StmtNode::Execute(ExecuteStmt::by_name(name.to_string(), args))
            }
            other => StmtNode::Other(other),
        }
    }
}

impl fmt::Display for StmtNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StmtNode::Execute(exec) => exec.fmt(f),
            StmtNode::Other(stmt) => stmt.fmt(f),
        }
    }
}
