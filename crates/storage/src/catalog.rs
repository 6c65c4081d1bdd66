use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use keel_common::{IndexId, KeelError, Result, SessionId, StorageEngine, TableId};
use serde::{Deserialize, Serialize};

use crate::stats::TableStats;

/// Database used for unqualified names when the session selected none.
pub const DEFAULT_DB: &str = "main";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Secondary index. The primary key is described by [`TableDef::primary_key`]
/// and is never listed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub id: IndexId,
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableLockMode {
    /// `LOCK TABLES t READ`: holder and others may read, nobody writes.
    Read,
    /// `LOCK TABLES t WRITE`: only the holder may read or write.
    Write,
}

/// Explicit table lock held by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLock {
    pub mode: TableLockMode,
    pub holder: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub id: TableId,
    #[serde(default = "default_db")]
    pub db: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Handle columns; empty when rows are keyed by a hidden row id.
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub stats: TableStats,
    /// Engines holding a readable copy of this table.
    #[serde(default = "default_replicas")]
    pub replicas: BTreeSet<StorageEngine>,
    #[serde(default)]
    pub lock: Option<TableLock>,
}

impl TableDef {
    pub fn new(id: i64, db: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: TableId(id),
            db: db.into(),
            name: name.into(),
            columns: vec![],
            primary_key: vec![],
            indexes: vec![],
            stats: TableStats::default(),
            replicas: default_replicas(),
            lock: None,
        }
    }

    pub fn with_column(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push(ColumnDef::new(name, data_type));
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_index(mut self, name: &str, columns: &[&str], unique: bool) -> Self {
        let id = IndexId(self.indexes.len() as i64 + 1);
        self.indexes.push(IndexDef {
            id,
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        });
        self
    }

    pub fn with_stats(mut self, rows: u64, bytes: u64) -> Self {
        self.stats = TableStats {
            rows: Some(rows),
            bytes: Some(bytes),
        };
        self
    }

    pub fn with_replica(mut self, engine: StorageEngine) -> Self {
        self.replicas.insert(engine);
        self
    }

    pub fn with_lock(mut self, mode: TableLockMode, holder: SessionId) -> Self {
        self.lock = Some(TableLock { mode, holder });
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.db, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// Whether `columns` is exactly the primary key column set.
    pub fn is_primary_key(&self, columns: &[String]) -> bool {
        same_column_set(&self.primary_key, columns)
    }

    pub fn has_replica(&self, engine: StorageEngine) -> bool {
        self.replicas.contains(&engine)
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        let fields = self
            .columns
            .iter()
            .map(|c| Field::new(c.name.as_str(), c.data_type.clone(), c.nullable))
            .collect::<Vec<_>>();
        Arc::new(Schema::new(fields))
    }

    fn validate(&self) -> Result<()> {
        for col in self.primary_key.iter().chain(
            self.indexes
                .iter()
                .flat_map(|i| i.columns.iter()),
        ) {
            if self.column(col).is_none() {
                return Err(KeelError::InvalidConfig(format!(
                    "table {} references unknown key column {col}",
                    self.qualified_name()
                )));
            }
        }
        Ok(())
    }
}

/// Whether two column lists name the same set, ignoring order and case.
pub fn same_column_set(a: &[String], b: &[String]) -> bool {
    if a.is_empty() || a.len() != b.len() {
        return false;
    }
    a.iter()
        .all(|x| b.iter().any(|y| y.eq_ignore_ascii_case(x)))
}

/// `db.table` key, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub db: String,
    pub name: String,
}

impl TableKey {
    pub fn new(db: &str, name: &str) -> Self {
        Self {
            db: db.to_ascii_lowercase(),
            name: name.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.name)
    }
}

/// Mutable catalog. Planning never reads it directly: it takes a
/// [`SchemaSnapshot`] per statement.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: BTreeMap<TableKey, TableDef>,
    version: i64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_table(&mut self, table: TableDef) -> Result<()> {
        table.validate()?;
        self.tables
            .insert(TableKey::new(&table.db, &table.name), table);
        self.version += 1;
        Ok(())
    }

    pub fn drop_table(&mut self, db: &str, name: &str) -> bool {
        let removed = self.tables.remove(&TableKey::new(db, name)).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Replace the lock state of a table.
    pub fn set_table_lock(&mut self, db: &str, name: &str, lock: Option<TableLock>) -> Result<()> {
        let table = self
            .tables
            .get_mut(&TableKey::new(db, name))
            .ok_or_else(|| KeelError::InvalidConfig(format!("unknown table: {db}.{name}")))?;
        table.lock = lock;
        self.version += 1;
        Ok(())
    }

    pub fn get(&self, db: &str, name: &str) -> Result<&TableDef> {
        self.tables
            .get(&TableKey::new(db, name))
            .ok_or_else(|| KeelError::PlanBuild(format!("unknown table: {db}.{name}")))
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Immutable point-in-time view.
    pub fn snapshot(&self) -> SchemaSnapshot {
        SchemaSnapshot {
            inner: Arc::new(SnapshotInner {
                version: self.version,
                tables: self.tables.clone(),
            }),
        }
    }

    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let tables: Vec<TableDef> =
            serde_json::from_str(s).map_err(|e| KeelError::InvalidConfig(e.to_string()))?;
        let mut cat = Catalog::new();
        for t in tables {
            cat.register_table(t)?;
        }
        Ok(cat)
    }
}

#[derive(Debug)]
struct SnapshotInner {
    version: i64,
    tables: BTreeMap<TableKey, TableDef>,
}

/// Immutable catalog view shared by concurrent planning calls.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    inner: Arc<SnapshotInner>,
}

impl SchemaSnapshot {
    pub fn version(&self) -> i64 {
        self.inner.version
    }

    pub fn table(&self, db: &str, name: &str) -> Result<&TableDef> {
        self.try_table(db, name)
            .ok_or_else(|| KeelError::PlanBuild(format!("unknown table: {db}.{name}")))
    }

    pub fn try_table(&self, db: &str, name: &str) -> Option<&TableDef> {
        self.inner.tables.get(&TableKey::new(db, name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.inner.tables.values()
    }
}

fn default_true() -> bool {
    true
}

fn default_db() -> String {
    DEFAULT_DB.to_string()
}

fn default_replicas() -> BTreeSet<StorageEngine> {
    BTreeSet::from([StorageEngine::Transactional])
}
