mod support;

use arrow_schema::DataType;
use keel_client::{is_read_only, optimize, PlanPath, QueryContext, Session, TimestampAcquisition};
use keel_common::{ErrorKind, OptimizerBackend, StatementId, StorageEngine};
use keel_planner::{ExecutePlan, FastPlan, Plan};
use keel_sql::{parse_sql, ExecuteStmt, StmtNode};
use keel_storage::{SchemaSnapshot, TableDef};
use support::{catalog, int, session, snapshot};

fn prepare(s: &mut Session, name: &str, sql: &str, snap: &SchemaSnapshot) -> StatementId {
    let stmt = parse_sql(sql).unwrap().remove(0);
    s.vars.register_prepared(name, stmt, snap.version())
}

fn execute(name: &str, args: Vec<keel_sql::ast::Expr>) -> StmtNode {
    StmtNode::Execute(ExecuteStmt::by_name(name, args))
}

fn execute_plan(plan: &Plan) -> &ExecutePlan {
    match plan {
        Plan::Execute(e) => e,
        other => panic!("expected execute plan, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_statement_is_not_found_and_counts_as_writer() {
    let snap = snapshot();
    let mut s = session();
    let node = execute("nope", vec![]);
    assert!(!is_read_only(&node, &s.vars));
    let err = optimize(&QueryContext::new("e-1"), &mut s, &node, &snap)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StatementNotFound);
    assert!(s
        .vars
        .isolation_read_engines
        .contains(&StorageEngine::AnalyticReplica));

    let by_id = StmtNode::Execute(ExecuteStmt::by_id(StatementId(42), vec![]));
    let err = optimize(&QueryContext::new("e-2"), &mut s, &by_id, &snap)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StatementNotFound);
}

#[tokio::test]
async fn execute_reuses_cached_plan_for_same_arguments() {
    let snap = snapshot();
    let mut s = session();
    let id = prepare(&mut s, "by_id", "SELECT name FROM users WHERE id = ?", &snap);

    let out = optimize(&QueryContext::new("p-1"), &mut s, &execute("by_id", vec![int(5)]), &snap)
        .await
        .unwrap();
    assert_eq!(out.path, PlanPath::Execute);
    let exec = execute_plan(&out.plan);
    assert_eq!(exec.statement_id, Some(id));
    assert!(!exec.from_cache);
    assert!(matches!(
        exec.plan.as_deref(),
        Some(Plan::Fast(FastPlan::PointGet(_)))
    ));
    assert_eq!(out.timestamp, TimestampAcquisition::Concurrent);
    assert!(s.vars.prepared_stmts[&id].has_cached_plan());
    s.take_txn_future();

    let again = optimize(&QueryContext::new("p-2"), &mut s, &execute("BY_ID", vec![int(5)]), &snap)
        .await
        .unwrap();
    assert!(execute_plan(&again.plan).from_cache);
    assert_eq!(again.timestamp, TimestampAcquisition::Concurrent);

    let other = optimize(&QueryContext::new("p-3"), &mut s, &execute("by_id", vec![int(6)]), &snap)
        .await
        .unwrap();
    assert!(!execute_plan(&other.plan).from_cache);
}

#[tokio::test]
async fn schema_change_invalidates_cached_plan() {
    let mut cat = catalog();
    let snap = cat.snapshot();
    let mut s = session();
    prepare(&mut s, "q", "SELECT amount FROM orders WHERE region = ?", &snap);
    let ctx = QueryContext::new("s-1");
    optimize(&ctx, &mut s, &execute("q", vec![int(1)]), &snap).await.unwrap();
    let hit = optimize(&ctx, &mut s, &execute("q", vec![int(1)]), &snap).await.unwrap();
    assert!(execute_plan(&hit.plan).from_cache);

    cat.register_table(
        TableDef::new(3, "main", "audit")
            .with_column("id", DataType::Int64)
            .with_primary_key(&["id"]),
    )
    .unwrap();
    let newer = cat.snapshot();
    assert!(newer.version() > snap.version());
    let miss = optimize(&ctx, &mut s, &execute("q", vec![int(1)]), &newer).await.unwrap();
    let exec = execute_plan(&miss.plan);
    assert!(!exec.from_cache);
    assert!(matches!(exec.plan.as_deref(), Some(Plan::Physical(_))));
}

#[tokio::test]
async fn disabled_cache_always_replans() {
    let snap = snapshot();
    let mut s = session();
    s.vars.enable_prepared_plan_cache = false;
    let id = prepare(&mut s, "q", "SELECT name FROM users WHERE id = ?", &snap);
    let ctx = QueryContext::new("d-1");
    for _ in 0..2 {
        let out = optimize(&ctx, &mut s, &execute("q", vec![int(9)]), &snap).await.unwrap();
        assert!(!execute_plan(&out.plan).from_cache);
        s.take_txn_future();
    }
    assert!(!s.vars.prepared_stmts[&id].has_cached_plan());
}

#[tokio::test]
async fn argument_count_must_match_placeholders() {
    let snap = snapshot();
    let mut s = session();
    prepare(&mut s, "two", "SELECT name FROM users WHERE id = ? AND email = ?", &snap);
    let err = optimize(&QueryContext::new("a-1"), &mut s, &execute("two", vec![int(1)]), &snap)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PlanBuild);
}

#[tokio::test]
async fn prepared_writes_are_narrowed_too() {
    let snap = snapshot();
    let mut s = session();
    prepare(&mut s, "w", "UPDATE orders SET amount = ? WHERE region = 3", &snap);
    let node = execute("w", vec![int(0)]);
    assert!(!is_read_only(&node, &s.vars));
    let out = optimize(&QueryContext::new("w-1"), &mut s, &node, &snap)
        .await
        .unwrap();
    let text = keel_planner::explain(&out.plan);
    assert!(text.contains("engine=transactional"), "{text}");
    assert!(!text.contains("engine=analytic_replica"), "{text}");
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);
    assert!(s
        .vars
        .isolation_read_engines
        .contains(&StorageEngine::AnalyticReplica));
}

#[tokio::test]
async fn cached_plan_follows_engine_and_backend_changes() {
    let snap = snapshot();
    let mut s = session();
    prepare(&mut s, "q", "SELECT amount FROM orders WHERE region = ?", &snap);
    let ctx = QueryContext::new("c-1");
    let first = optimize(&ctx, &mut s, &execute("q", vec![int(1)]), &snap).await.unwrap();
    let text = keel_planner::explain(&first.plan);
    assert!(text.contains("engine=analytic_replica"), "{text}");

    s.vars
        .isolation_read_engines
        .remove(&StorageEngine::AnalyticReplica);
    let narrowed = optimize(&ctx, &mut s, &execute("q", vec![int(1)]), &snap).await.unwrap();
    assert!(!execute_plan(&narrowed.plan).from_cache);
    let text = keel_planner::explain(&narrowed.plan);
    assert!(!text.contains("engine=analytic_replica"), "{text}");

    let hit = optimize(&ctx, &mut s, &execute("q", vec![int(1)]), &snap).await.unwrap();
    assert!(execute_plan(&hit.plan).from_cache);

    s.vars.optimizer_backend = OptimizerBackend::Cascades;
    let switched = optimize(&ctx, &mut s, &execute("q", vec![int(1)]), &snap).await.unwrap();
    assert!(!execute_plan(&switched.plan).from_cache);
}
