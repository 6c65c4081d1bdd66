//! Plan selection for one statement.
//!
//! ```text
//! Start -> (engine eligibility adjusted)
//!       -> FastPath -> Done
//!        | Build -> Validate -> Dispatch -> Done
//! ```
//!
//! Eligibility is restored at `Done` on every exit path.

use std::time::Instant;

use keel_common::metrics::global_metrics;
use keel_common::{KeelError, OptimizerBackend, Result, StorageEngine};
use keel_planner::cascades::find_best_plan;
use keel_planner::{
    check_privilege, try_fast_plan, visit_records, ExecutePlan, FastPlan, FastPlanContext,
    LogicalPlan, OptFlags, Optimizer, OptimizerConfig, PhysicalContext, PhysicalPlan,
    PhysicalPlanner, Plan, PlanBuilder, VisitRecord,
};
use keel_sql::StmtNode;
use keel_storage::{SchemaSnapshot, TableKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::guard::EngineRestriction;
use crate::prepared::{is_read_only, resolve_prepared};
use crate::session::{CachedPlan, Session};
use crate::txn::TimestampAcquisition;

/// Per-query context.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: String,
    pub cancel: CancellationToken,
}

impl QueryContext {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(KeelError::Cancelled);
        }
        Ok(())
    }
}

/// How the plan was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanPath {
    Fast,
    RulePipeline,
    Cascades,
    NonLogical,
    Execute,
}

impl PlanPath {
    /// Metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            PlanPath::Fast => "fast",
            PlanPath::RulePipeline => "rule_pipeline",
            PlanPath::Cascades => "cascades",
            PlanPath::NonLogical => "non_logical",
            PlanPath::Execute => "execute",
        }
    }
}

/// Result of [`optimize`].
#[derive(Debug)]
pub struct Optimized {
    pub plan: Plan,
    pub path: PlanPath,
    pub timestamp: TimestampAcquisition,
}

struct Planned {
    plan: Plan,
    path: PlanPath,
    visits: Vec<VisitRecord>,
}

/// Produce an executable plan for `node`.
///
/// Statements that may write never see the analytic replica: it is removed
/// from the session's eligible engines for the duration of the call and put
/// back before returning, whatever the outcome.
pub async fn optimize(
    ctx: &QueryContext,
    session: &mut Session,
    node: &StmtNode,
    snapshot: &SchemaSnapshot,
) -> Result<Optimized> {
    let start = Instant::now();
    session.vars.plan_ids.reset();
    let result = optimize_inner(ctx, session, node, snapshot);
    let secs = start.elapsed().as_secs_f64();
    match &result {
        Ok(out) => {
            global_metrics().record_plan(out.path.as_str(), secs);
            info!(
                query_id = %ctx.query_id,
                operator = "Optimize",
                path = out.path.as_str(),
                plan = out.plan.kind(),
                timestamp = ?out.timestamp,
                "plan selected"
            );
        }
        Err(e) => {
            global_metrics().record_error(e.kind().as_str());
            warn!(
                query_id = %ctx.query_id,
                operator = "Optimize",
                error = %e,
                "planning failed"
            );
        }
    }
    result
}

fn optimize_inner(
    ctx: &QueryContext,
    session: &mut Session,
    node: &StmtNode,
    snapshot: &SchemaSnapshot,
) -> Result<Optimized> {
    session.discard_txn_future();
    ctx.check_cancelled()?;
    let read_only = is_read_only(node, &session.vars);
    let mut guard = if read_only {
        EngineRestriction::none(session)
    } else {
        EngineRestriction::narrow(session, StorageEngine::AnalyticReplica)
    };
    let planned = plan_statement(ctx, &mut guard, node, snapshot)?;

    let timestamp = if starts_timestamp_early(&guard, &planned.plan) {
        guard.prepare_txn_future(&ctx.cancel);
        TimestampAcquisition::Concurrent
    } else {
        TimestampAcquisition::Deferred
    };
    Ok(Optimized {
        plan: planned.plan,
        path: planned.path,
        timestamp,
    })
}

/// Only a primary key point read in an autocommit statement may race its
/// timestamp request against plan return. A unique index read must check
/// the index entry with an already fixed timestamp before fetching the row.
fn starts_timestamp_early(session: &Session, plan: &Plan) -> bool {
    let fast = match plan {
        Plan::Fast(f) => f,
        Plan::Execute(ExecutePlan { plan: Some(inner), .. }) => match &**inner {
            Plan::Fast(f) => f,
            _ => return false,
        },
        _ => return false,
    };
    fast.is_pure_primary_key_get() && session.vars.autocommit && !session.vars.in_txn
}

fn plan_statement(
    ctx: &QueryContext,
    session: &mut Session,
    node: &StmtNode,
    snapshot: &SchemaSnapshot,
) -> Result<Planned> {
    if let Some(fast) = fast_path(session, node, snapshot)? {
        let (db, table) = fast.db_table();
        session.vars.stmt_ctx.referenced_tables = vec![TableKey::new(db, table)];
        let visits = visit_records(&fast);
        return Ok(Planned {
            plan: Plan::Fast(fast),
            path: PlanPath::Fast,
            visits,
        });
    }

    // Build. A fast path miss may have handed out ids already.
    let (plan, visits, tables, flags) = {
        let vars = &mut session.vars;
        vars.plan_ids.reset();
        let mut builder = PlanBuilder::new(snapshot, &vars.current_db, &mut vars.plan_ids);
        let plan = builder.build(node)?;
        (
            plan,
            builder.visit_records().to_vec(),
            builder.referenced_tables().to_vec(),
            builder.opt_flags(),
        )
    };
    session.vars.stmt_ctx.referenced_tables = tables;
    ctx.check_cancelled()?;

    // Validate
    validate(session, snapshot, &visits)?;
    ctx.check_cancelled()?;

    dispatch(ctx, session, plan, visits, flags, snapshot)
}

fn dispatch(
    ctx: &QueryContext,
    session: &mut Session,
    plan: Plan,
    visits: Vec<VisitRecord>,
    flags: OptFlags,
    snapshot: &SchemaSnapshot,
) -> Result<Planned> {
    match plan {
        Plan::Execute(exec) => plan_execute(ctx, session, exec, snapshot),
        Plan::Logical(logical) => {
            let (physical, path) = dispatch_logical(session, logical, flags, snapshot)?;
            Ok(Planned {
                plan: Plan::Physical(physical),
                path,
                visits,
            })
        }
        Plan::NonLogical(_) => Ok(Planned {
            plan,
            path: PlanPath::NonLogical,
            visits,
        }),
        Plan::Fast(_) | Plan::Physical(_) => Err(KeelError::PlanBuild(format!(
            "builder produced an unexpected {} plan",
            plan.kind()
        ))),
    }
}

fn fast_path(session: &mut Session, node: &StmtNode, snapshot: &SchemaSnapshot) -> Result<Option<FastPlan>> {
    let vars = &mut session.vars;
    if !vars.isolation_read_engines.contains(&StorageEngine::Transactional) {
        return Ok(None);
    }
    let ctx = FastPlanContext {
        snapshot,
        current_db: &vars.current_db,
        engines: &vars.isolation_read_engines,
        privileges: session
            .privileges
            .as_deref()
            .map(|pm| (pm, vars.active_roles.as_slice())),
    };
    try_fast_plan(&ctx, &mut vars.plan_ids, node)
}

/// Privileges first, then table locks.
fn validate(session: &Session, snapshot: &SchemaSnapshot, visits: &[VisitRecord]) -> Result<()> {
    if let Some(pm) = session.privileges.as_deref() {
        check_privilege(&session.vars.active_roles, pm, visits)?;
    }
    session
        .lock_checker
        .check_table_lock(session.id, snapshot, visits)
}

fn dispatch_logical(
    session: &Session,
    plan: LogicalPlan,
    flags: OptFlags,
    snapshot: &SchemaSnapshot,
) -> Result<(PhysicalPlan, PlanPath)> {
    let vars = &session.vars;
    let pctx = PhysicalContext {
        snapshot,
        engines: &vars.isolation_read_engines,
        broadcast_threshold_bytes: vars.broadcast_threshold_bytes,
        shuffle_partitions: vars.shuffle_partitions,
        target_batch_rows: vars.target_batch_rows,
    };
    match vars.optimizer_backend {
        OptimizerBackend::Cascades => Ok((find_best_plan(&plan, &pctx)?, PlanPath::Cascades)),
        OptimizerBackend::RulePipeline => {
            let cfg = OptimizerConfig {
                broadcast_threshold_bytes: vars.broadcast_threshold_bytes,
            };
            let optimized = Optimizer::new().optimize(plan, flags, snapshot, cfg)?;
            let physical = PhysicalPlanner::new(pctx).create_physical_plan(&optimized)?;
            Ok((physical, PlanPath::RulePipeline))
        }
    }
}

/// Re-optimize a prepared statement for one `EXECUTE`, reusing the cached
/// plan when schema version and arguments are unchanged.
fn plan_execute(
    ctx: &QueryContext,
    session: &mut Session,
    mut exec: ExecutePlan,
    snapshot: &SchemaSnapshot,
) -> Result<Planned> {
    let (id, prepared) = resolve_prepared(&exec.stmt, &session.vars)?;
    if exec.stmt.args.len() != prepared.param_count {
        return Err(KeelError::PlanBuild(format!(
            "incorrect arguments to EXECUTE: expected {}, got {}",
            prepared.param_count,
            exec.stmt.args.len()
        )));
    }
    exec.statement_id = Some(id);

    let cached = prepared
        .cached
        .as_ref()
        .filter(|c| {
            session.vars.enable_prepared_plan_cache
                && c.schema_version == snapshot.version()
                && c.args == exec.stmt.args
                && c.engines == session.vars.isolation_read_engines
                && c.backend == session.vars.optimizer_backend
        })
        .cloned();
    if let Some(hit) = cached {
        validate(session, snapshot, &hit.visits)?;
        debug!(query_id = %ctx.query_id, operator = "PreparedPlanCache", id = %id, "cache hit");
        exec.plan = Some(Box::new(hit.plan));
        exec.from_cache = true;
        return Ok(Planned {
            plan: Plan::Execute(exec),
            path: PlanPath::Execute,
            visits: hit.visits,
        });
    }

    let mut statement = prepared.statement.clone();
    keel_sql::bind_placeholders(&mut statement, &exec.stmt.args)?;
    let inner = plan_statement(ctx, session, &StmtNode::Other(statement), snapshot)?;
    if matches!(inner.plan, Plan::Execute(_)) {
        return Err(KeelError::PlanBuild(
            "a prepared statement can not EXECUTE another".to_string(),
        ));
    }

    let cacheable = matches!(inner.plan, Plan::Fast(_) | Plan::Physical(_));
    if session.vars.enable_prepared_plan_cache && cacheable {
        if let Some(p) = session.vars.prepared_stmts.get_mut(&id) {
            p.cached = Some(CachedPlan {
                schema_version: snapshot.version(),
                args: exec.stmt.args.clone(),
                plan: inner.plan.clone(),
                engines: session.vars.isolation_read_engines.clone(),
                backend: session.vars.optimizer_backend,
                visits: inner.visits.clone(),
            });
        }
    }
    exec.plan = Some(Box::new(inner.plan));
    Ok(Planned {
        plan: Plan::Execute(exec),
        path: PlanPath::Execute,
        visits: inner.visits,
    })
}

#[cfg(test)]
mod tests {
    use keel_common::{ErrorKind, PlanId, PlannerConfig, SessionId, TableId};
    use keel_planner::{BatchPointGetPlan, FastPlan, OptFlags, Plan};
    use keel_storage::Catalog;

    use super::{dispatch, QueryContext};
    use crate::session::Session;

    #[test]
    fn already_optimized_plans_are_rejected_by_dispatch() {
        let snap = Catalog::new().snapshot();
        let mut s = Session::new(SessionId(1), &PlannerConfig::default());
        let plan = Plan::Fast(FastPlan::BatchPointGet(BatchPointGetPlan {
            id: PlanId(1),
            db: "main".to_string(),
            table: "t".to_string(),
            table_id: TableId(1),
            key_column: "id".to_string(),
            keys: vec![],
            columns: vec![],
            lock: false,
        }));
        let err = dispatch(
            &QueryContext::new("d"),
            &mut s,
            plan,
            vec![],
            OptFlags::default(),
            &snap,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::PlanBuild);
    }
}
