use std::collections::HashSet;
use std::fmt;

use keel_common::{KeelError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
    Super,
}

impl Privilege {
    pub fn as_str(self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
            Privilege::Super => "SUPER",
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Privilege::Insert | Privilege::Update | Privilege::Delete)
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One access obligation collected while building a plan. Empty `db` and
/// `table` denote a global (server-level) privilege.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisitRecord {
    pub privilege: Privilege,
    pub db: String,
    pub table: String,
    pub column: Option<String>,
}

impl VisitRecord {
    pub fn table(privilege: Privilege, db: &str, table: &str) -> Self {
        Self {
            privilege,
            db: db.to_string(),
            table: table.to_string(),
            column: None,
        }
    }

    pub fn global(privilege: Privilege) -> Self {
        Self {
            privilege,
            db: String::new(),
            table: String::new(),
            column: None,
        }
    }

    pub fn with_column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn object_name(&self) -> String {
        if self.table.is_empty() {
            "*.*".to_string()
        } else {
            format!("{}.{}", self.db, self.table)
        }
    }
}

/// `'user'@'host'`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleIdentity {
    pub user: String,
    pub host: String,
}

impl RoleIdentity {
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
        }
    }
}

impl fmt::Display for RoleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'@'{}'", self.user, self.host)
    }
}

/// Answers whether any of the active roles holds a privilege on an object.
pub trait PrivilegeManager: Send + Sync {
    fn request_verification(
        &self,
        roles: &[RoleIdentity],
        db: &str,
        table: &str,
        column: &str,
        privilege: Privilege,
    ) -> bool;
}

/// In-memory grants at global, database or table scope. `*` matches any
/// database or table.
#[derive(Debug, Default)]
pub struct GrantTable {
    grants: RwLock<HashSet<(RoleIdentity, Privilege, String, String)>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, role: &RoleIdentity, privilege: Privilege, db: &str, table: &str) {
        self.grants.write().insert((
            role.clone(),
            privilege,
            db.to_ascii_lowercase(),
            table.to_ascii_lowercase(),
        ));
    }

    pub fn revoke(&self, role: &RoleIdentity, privilege: Privilege, db: &str, table: &str) {
        self.grants.write().remove(&(
            role.clone(),
            privilege,
            db.to_ascii_lowercase(),
            table.to_ascii_lowercase(),
        ));
    }
}

impl PrivilegeManager for GrantTable {
    fn request_verification(
        &self,
        roles: &[RoleIdentity],
        db: &str,
        table: &str,
        _column: &str,
        privilege: Privilege,
    ) -> bool {
        let grants = self.grants.read();
        let db = db.to_ascii_lowercase();
        let table = table.to_ascii_lowercase();
        let star = "*".to_string();
        roles.iter().any(|role| {
            let has = |d: &String, t: &String| {
                grants.contains(&(role.clone(), privilege, d.clone(), t.clone()))
            };
            has(&star, &star) || has(&db, &star) || has(&db, &table)
        })
    }
}

/// Fail on the first record, in visit order, that no active role is granted.
pub fn check_privilege(
    roles: &[RoleIdentity],
    pm: &dyn PrivilegeManager,
    records: &[VisitRecord],
) -> Result<()> {
    for r in records {
        let column = r.column.as_deref().unwrap_or("");
        if !pm.request_verification(roles, &r.db, &r.table, column, r.privilege) {
            return Err(KeelError::PrivilegeDenied {
                privilege: r.privilege.to_string(),
                roles: roles
                    .iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                object: r.object_name(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use keel_common::KeelError;

    use super::{check_privilege, GrantTable, Privilege, RoleIdentity, VisitRecord};

    #[test]
    fn first_missing_grant_in_visit_order_is_reported() {
        let app = RoleIdentity::new("app", "%");
        let grants = GrantTable::new();
        grants.grant(&app, Privilege::Select, "main", "*");

        let records = vec![
            VisitRecord::table(Privilege::Select, "main", "orders"),
            VisitRecord::table(Privilege::Update, "main", "orders"),
            VisitRecord::table(Privilege::Delete, "main", "orders"),
        ];
        let err = check_privilege(std::slice::from_ref(&app), &grants, &records).unwrap_err();
        match err {
            KeelError::PrivilegeDenied {
                privilege, object, ..
            } => {
                assert_eq!(privilege, "UPDATE");
                assert_eq!(object, "main.orders");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn global_grant_covers_every_table() {
        let root = RoleIdentity::new("root", "localhost");
        let grants = GrantTable::new();
        grants.grant(&root, Privilege::Super, "*", "*");
        grants.grant(&root, Privilege::Select, "*", "*");
        let records = vec![
            VisitRecord::global(Privilege::Super),
            VisitRecord::table(Privilege::Select, "other", "t").with_column("a"),
        ];
        check_privilege(&[root.clone()], &grants, &records).unwrap();

        grants.revoke(&root, Privilege::Super, "*", "*");
        let err = check_privilege(&[root], &grants, &records).unwrap_err();
        assert!(err.to_string().contains("'*.*'"));
    }
}
