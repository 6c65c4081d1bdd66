//! Restricted access to the internal system variable table.
//!
//! The GC guard never talks to user tables. It issues a small, fixed set of
//! statements against `keel_system.variables` through
//! [`RestrictedSqlExecutor`], so a real deployment can route them through its
//! internal SQL session while tests and embedded setups use
//! [`MemSystemTable`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use keel_common::{KeelError, Result};
use parking_lot::RwLock;

/// Reads one variable. Args: `[name]`.
pub const SELECT_VARIABLE_SQL: &str =
    "SELECT variable_value FROM keel_system.variables WHERE variable_name = ?";

/// Upserts one variable. Args: `[name, value, comment, value, comment]`.
pub const UPSERT_VARIABLE_SQL: &str = "INSERT INTO keel_system.variables VALUES (?, ?, ?) \
     ON DUPLICATE KEY UPDATE variable_value = ?, comment = ?";

/// One result row of a restricted statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemRow {
    values: Vec<String>,
}

impl SystemRow {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    pub fn get_string(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Executes internal statements on behalf of the engine, bypassing user
/// privilege checks.
#[async_trait]
pub trait RestrictedSqlExecutor: Send + Sync {
    /// Run `sql` with positional `args` and return all rows.
    ///
    /// `INSERT ... ON DUPLICATE KEY UPDATE` must behave as an upsert.
    async fn exec_restricted_sql(&self, sql: &str, args: &[String]) -> Result<Vec<SystemRow>>;
}

#[derive(Debug, Clone)]
struct Variable {
    value: String,
    comment: String,
}

/// In-memory `keel_system.variables`.
#[derive(Debug, Default)]
pub struct MemSystemTable {
    vars: RwLock<BTreeMap<String, Variable>>,
}

impl MemSystemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a variable directly.
    pub fn set_variable(&self, name: &str, value: &str, comment: &str) {
        self.vars.write().insert(
            name.to_string(),
            Variable {
                value: value.to_string(),
                comment: comment.to_string(),
            },
        );
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.vars.read().get(name).map(|v| v.value.clone())
    }

    pub fn comment(&self, name: &str) -> Option<String> {
        self.vars.read().get(name).map(|v| v.comment.clone())
    }
}

#[async_trait]
impl RestrictedSqlExecutor for MemSystemTable {
    async fn exec_restricted_sql(&self, sql: &str, args: &[String]) -> Result<Vec<SystemRow>> {
        match sql {
            SELECT_VARIABLE_SQL => {
                let [name] = args else {
                    return Err(arity_error(sql, 1, args.len()));
                };
                Ok(self
                    .vars
                    .read()
                    .get(name)
                    .map(|v| SystemRow::new(vec![v.value.clone()]))
                    .into_iter()
                    .collect())
            }
            UPSERT_VARIABLE_SQL => {
                let [name, value, comment, update_value, update_comment] = args else {
                    return Err(arity_error(sql, 5, args.len()));
                };
                let mut vars = self.vars.write();
                match vars.get_mut(name) {
                    Some(existing) => {
                        existing.value = update_value.clone();
                        existing.comment = update_comment.clone();
                    }
                    None => {
                        vars.insert(
                            name.clone(),
                            Variable {
                                value: value.clone(),
                                comment: comment.clone(),
                            },
                        );
                    }
                }
                Ok(vec![])
            }
            other => Err(KeelError::Unsupported(format!(
                "restricted statement not recognized: {other}"
            ))),
        }
    }
}

fn arity_error(sql: &str, expected: usize, got: usize) -> KeelError {
    KeelError::Storage(format!(
        "statement '{sql}' expects {expected} arguments, got {got}"
    ))
}

#[cfg(test)]
mod tests {
    use super::{MemSystemTable, RestrictedSqlExecutor, SELECT_VARIABLE_SQL, UPSERT_VARIABLE_SQL};

    fn upsert_args(name: &str, value: &str) -> Vec<String> {
        let comment = format!("{name} comment");
        vec![
            name.to_string(),
            value.to_string(),
            comment.clone(),
            value.to_string(),
            comment,
        ]
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates() {
        let table = MemSystemTable::new();
        table
            .exec_restricted_sql(UPSERT_VARIABLE_SQL, &upsert_args("k", "1"))
            .await
            .unwrap();
        table
            .exec_restricted_sql(UPSERT_VARIABLE_SQL, &upsert_args("k", "2"))
            .await
            .unwrap();

        let rows = table
            .exec_restricted_sql(SELECT_VARIABLE_SQL, &["k".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_string(0), Some("2"));
    }

    #[tokio::test]
    async fn missing_variable_yields_no_rows() {
        let table = MemSystemTable::new();
        let rows = table
            .exec_restricted_sql(SELECT_VARIABLE_SQL, &["absent".to_string()])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn unknown_statement_is_rejected() {
        let table = MemSystemTable::new();
        assert!(table
            .exec_restricted_sql("DELETE FROM keel_system.variables", &[])
            .await
            .is_err());
    }
}
