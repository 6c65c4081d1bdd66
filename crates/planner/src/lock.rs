use keel_common::{KeelError, Result, SessionId};
use keel_storage::{SchemaSnapshot, TableLockMode};

use crate::privilege::{Privilege, VisitRecord};

/// Checks the statement's visit records against explicit table locks.
pub trait TableLockChecker: Send + Sync {
    fn check_table_lock(
        &self,
        session_id: SessionId,
        snapshot: &SchemaSnapshot,
        records: &[VisitRecord],
    ) -> Result<()>;
}

/// Reads lock state straight from the schema snapshot.
///
/// - a table locked by another session may only be read, and only while
///   that lock is a READ lock
/// - a session holding a READ lock may not write the table itself
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogLockChecker;

impl TableLockChecker for CatalogLockChecker {
    fn check_table_lock(
        &self,
        session_id: SessionId,
        snapshot: &SchemaSnapshot,
        records: &[VisitRecord],
    ) -> Result<()> {
        for r in records {
            if r.table.is_empty() {
                continue;
            }
            let Some(table) = snapshot.try_table(&r.db, &r.table) else {
                continue;
            };
            let Some(lock) = table.lock else {
                continue;
            };
            let locked = |reason: &str| KeelError::TableLocked {
                table: table.qualified_name(),
                reason: reason.to_string(),
            };
            if lock.holder != session_id {
                let read_under_read_lock =
                    r.privilege == Privilege::Select && lock.mode == TableLockMode::Read;
                if !read_under_read_lock {
                    return Err(locked(&format!(
                        "held by session {} in {:?} mode",
                        lock.holder, lock.mode
                    )));
                }
            } else if lock.mode == TableLockMode::Read && r.privilege.is_write() {
                return Err(locked("table was locked with a READ lock and can't be updated"));
            }
        }
        Ok(())
    }
}
