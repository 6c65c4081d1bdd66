use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use keel_common::{
    KeelError, OptimizerBackend, PlannerConfig, Result, SessionId, StatementId, StorageEngine,
    Timestamp,
};
use keel_planner::{
    CatalogLockChecker, IdAllocator, Plan, PrivilegeManager, RoleIdentity, TableLockChecker,
    VisitRecord,
};
use keel_sql::ast::{Expr, Statement};
use keel_storage::{gc, RestrictedSqlExecutor, TableKey};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::txn::{LocalOracle, TimestampOracle, TxnFuture};

pub const DEFAULT_DB: &str = "main";

/// A statement registered with `PREPARE`.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: Option<String>,
    pub statement: Statement,
    /// Placeholders `EXECUTE` must bind.
    pub param_count: usize,
    /// Schema version the statement was prepared against.
    pub schema_version: i64,
    pub(crate) cached: Option<CachedPlan>,
}

impl PreparedStatement {
    pub fn has_cached_plan(&self) -> bool {
        self.cached.is_some()
    }
}

/// Plan reused by later executions with the same arguments.
#[derive(Debug, Clone)]
pub(crate) struct CachedPlan {
    pub(crate) schema_version: i64,
    pub(crate) args: Vec<Expr>,
    pub(crate) plan: Plan,
    /// Eligible engines and backend the plan was chosen under.
    pub(crate) engines: BTreeSet<StorageEngine>,
    pub(crate) backend: OptimizerBackend,
    /// Re-validated on every reuse.
    pub(crate) visits: Vec<VisitRecord>,
}

/// Per-statement facts recorded by the last planning call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementContext {
    /// Tables the statement touches, de-duplicated, in first-reference order.
    pub referenced_tables: Vec<TableKey>,
}

/// Per-connection session variables.
#[derive(Debug)]
pub struct SessionVars {
    pub prepared_stmt_name_to_id: HashMap<String, StatementId>,
    pub prepared_stmts: HashMap<StatementId, PreparedStatement>,
    /// Engines this session may read from.
    pub isolation_read_engines: BTreeSet<StorageEngine>,
    pub autocommit: bool,
    pub in_txn: bool,
    pub active_roles: Vec<RoleIdentity>,
    /// Reset at the start of every top-level planning call.
    pub plan_ids: IdAllocator,
    pub optimizer_backend: OptimizerBackend,
    pub stmt_ctx: StatementContext,
    /// Historical read point; only set through [`Session::set_snapshot_ts`].
    pub snapshot_ts: Option<Timestamp>,
    pub current_db: String,
    pub broadcast_threshold_bytes: u64,
    pub shuffle_partitions: usize,
    pub target_batch_rows: usize,
    pub enable_prepared_plan_cache: bool,
    next_stmt_id: u32,
}

impl SessionVars {
    pub fn new(cfg: &PlannerConfig) -> Self {
        Self {
            prepared_stmt_name_to_id: HashMap::new(),
            prepared_stmts: HashMap::new(),
            isolation_read_engines: cfg.isolation_read_engines.clone(),
            autocommit: cfg.autocommit,
            in_txn: false,
            active_roles: vec![],
            plan_ids: IdAllocator::new(),
            optimizer_backend: cfg.optimizer_backend,
            stmt_ctx: StatementContext::default(),
            snapshot_ts: None,
            current_db: DEFAULT_DB.to_string(),
            broadcast_threshold_bytes: cfg.broadcast_threshold_bytes,
            shuffle_partitions: cfg.shuffle_partitions,
            target_batch_rows: cfg.target_batch_rows,
            enable_prepared_plan_cache: cfg.enable_prepared_plan_cache,
            next_stmt_id: 0,
        }
    }

    /// `PREPARE name FROM ...`. Re-preparing a name replaces the old
    /// statement. Ids start at 1 and are never reused within a session.
    pub fn register_prepared(
        &mut self,
        name: &str,
        statement: Statement,
        schema_version: i64,
    ) -> StatementId {
        let key = name.to_ascii_lowercase();
        if let Some(old) = self.prepared_stmt_name_to_id.remove(&key) {
            self.prepared_stmts.remove(&old);
        }
        self.next_stmt_id += 1;
        let id = StatementId(self.next_stmt_id);
        let param_count = keel_sql::placeholder_count(&statement);
        self.prepared_stmts.insert(
            id,
            PreparedStatement {
                name: Some(name.to_string()),
                statement,
                param_count,
                schema_version,
                cached: None,
            },
        );
        self.prepared_stmt_name_to_id.insert(key, id);
        debug!(operator = "PreparedRegistry", name, id = %id, param_count, "registered prepared statement");
        id
    }

    /// `DEALLOCATE PREPARE name`.
    pub fn deallocate_prepared(&mut self, name: &str) -> Result<()> {
        let id = self
            .prepared_stmt_name_to_id
            .remove(&name.to_ascii_lowercase())
            .ok_or_else(|| KeelError::StatementNotFound(name.to_string()))?;
        self.prepared_stmts.remove(&id);
        Ok(())
    }
}

/// One client connection: variables plus the collaborators planning uses.
pub struct Session {
    pub id: SessionId,
    pub vars: SessionVars,
    pub(crate) privileges: Option<Arc<dyn PrivilegeManager>>,
    pub(crate) lock_checker: Arc<dyn TableLockChecker>,
    oracle: Arc<dyn TimestampOracle>,
    system: Option<Arc<dyn RestrictedSqlExecutor>>,
    txn_future: Option<TxnFuture>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("vars", &self.vars)
            .field("privilege_checks", &self.privileges.is_some())
            .field("txn_future", &self.txn_future.is_some())
            .finish()
    }
}

impl Session {
    pub fn new(id: SessionId, cfg: &PlannerConfig) -> Self {
        Self {
            id,
            vars: SessionVars::new(cfg),
            privileges: None,
            lock_checker: Arc::new(CatalogLockChecker),
            oracle: Arc::new(LocalOracle::new()),
            system: None,
            txn_future: None,
        }
    }

    /// Without a privilege manager no privilege checks run.
    pub fn with_privilege_manager(mut self, pm: Arc<dyn PrivilegeManager>) -> Self {
        self.privileges = Some(pm);
        self
    }

    pub fn with_lock_checker(mut self, checker: Arc<dyn TableLockChecker>) -> Self {
        self.lock_checker = checker;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn TimestampOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_system_executor(mut self, exec: Arc<dyn RestrictedSqlExecutor>) -> Self {
        self.system = Some(exec);
        self
    }

    /// Use `ts` for subsequent reads, after checking it against the GC
    /// safe point.
    pub async fn set_snapshot_ts(&mut self, cancel: &CancellationToken, ts: Timestamp) -> Result<()> {
        let exec = self.system.as_deref().ok_or_else(|| {
            KeelError::InvalidConfig("no system executor configured for snapshot reads".to_string())
        })?;
        gc::validate_snapshot(cancel, exec, ts).await?;
        self.vars.snapshot_ts = Some(ts);
        Ok(())
    }

    pub fn clear_snapshot_ts(&mut self) {
        self.vars.snapshot_ts = None;
    }

    /// Start a fresh transaction timestamp request, abandoning any earlier
    /// one.
    pub fn prepare_txn_future(&mut self, cancel: &CancellationToken) {
        self.discard_txn_future();
        self.txn_future = Some(TxnFuture::spawn(Arc::clone(&self.oracle), cancel.clone()));
    }

    /// Drop a request left over from an earlier statement; its timestamp
    /// must not serve a later one.
    pub fn discard_txn_future(&mut self) {
        if let Some(old) = self.txn_future.take() {
            old.abort();
            debug!(operator = "TxnFuture", session = %self.id, "discarded unconsumed timestamp request");
        }
    }

    pub fn has_pending_txn_future(&self) -> bool {
        self.txn_future.is_some()
    }

    pub fn take_txn_future(&mut self) -> Option<TxnFuture> {
        self.txn_future.take()
    }

    /// Transaction start timestamp: the request started during planning if
    /// there is one, otherwise a new one.
    pub async fn txn_timestamp(&mut self, cancel: &CancellationToken) -> Result<Timestamp> {
        match self.txn_future.take() {
            Some(fut) => fut.wait().await,
            None => TxnFuture::spawn(Arc::clone(&self.oracle), cancel.clone()).wait().await,
        }
    }
}
