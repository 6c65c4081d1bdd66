mod support;

use std::sync::Arc;

use keel_client::{optimize, PlanPath, QueryContext, TimestampAcquisition};
use keel_common::{ErrorKind, KeelError, OptimizerBackend, SessionId, StorageEngine};
use keel_planner::{
    explain, FastPlan, GrantTable, IdAllocator, Plan, PlanBuilder, Privilege, RoleIdentity,
};
use keel_sql::parse_one;
use keel_storage::{TableKey, TableLock, TableLockMode};
use support::{catalog, session, snapshot, CountingOracle};

fn ctx() -> QueryContext {
    QueryContext::new("q-1")
}

fn has_analytic(s: &keel_client::Session) -> bool {
    s.vars
        .isolation_read_engines
        .contains(&StorageEngine::AnalyticReplica)
}

#[tokio::test]
async fn write_plans_never_read_the_analytic_replica() {
    let snap = snapshot();
    let mut s = session();
    let node = parse_one("UPDATE orders SET amount = 0 WHERE region = 3").unwrap();
    let out = optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    let text = explain(&out.plan);
    assert_eq!(out.path, PlanPath::RulePipeline);
    assert!(text.contains("Update table=main.orders"), "{text}");
    assert!(text.contains("engine=transactional"), "{text}");
    assert!(!text.contains("engine=analytic_replica"), "{text}");
    assert!(has_analytic(&s));
}

#[tokio::test]
async fn reads_may_use_the_analytic_replica() {
    let snap = snapshot();
    let mut s = session();
    let node = parse_one("SELECT region, SUM(amount) FROM orders GROUP BY region").unwrap();
    let out = optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    let text = explain(&out.plan);
    assert!(text.contains("engine=analytic_replica"), "{text}");
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);
}

#[tokio::test]
async fn eligibility_is_restored_when_planning_fails() {
    let snap = snapshot();
    let mut s = session();
    let node = parse_one("UPDATE missing SET a = 1 WHERE b = 2").unwrap();
    let err = optimize(&ctx(), &mut s, &node, &snap).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PlanBuild);
    assert!(has_analytic(&s));
}

#[tokio::test]
async fn cancelled_query_stops_before_planning() {
    let snap = snapshot();
    let mut s = session();
    let qctx = ctx();
    qctx.cancel.cancel();
    let node = parse_one("DELETE FROM orders WHERE region = 1").unwrap();
    let err = optimize(&qctx, &mut s, &node, &snap).await.unwrap_err();
    assert!(matches!(err, KeelError::Cancelled));
    assert!(has_analytic(&s));
    assert!(!s.has_pending_txn_future());
}

#[tokio::test]
async fn primary_key_point_read_starts_timestamp_early() {
    let snap = snapshot();
    let oracle = CountingOracle::new();
    let mut s = session().with_oracle(oracle.clone());
    let node = parse_one("SELECT name FROM users WHERE id = 7").unwrap();
    let out = optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    assert_eq!(out.path, PlanPath::Fast);
    assert!(matches!(out.plan, Plan::Fast(FastPlan::PointGet(_))));
    assert_eq!(out.timestamp, TimestampAcquisition::Concurrent);
    assert!(s.has_pending_txn_future());

    let ts = s.take_txn_future().unwrap().wait().await.unwrap();
    assert!(ts.physical_ms() > 0);
    assert_eq!(oracle.calls(), 1);
    assert_eq!(
        s.vars.stmt_ctx.referenced_tables,
        vec![TableKey::new("main", "users")]
    );
}

#[tokio::test]
async fn unique_index_point_read_defers_timestamp() {
    let snap = snapshot();
    let oracle = CountingOracle::new();
    let mut s = session().with_oracle(oracle.clone());
    let node = parse_one("SELECT name FROM users WHERE email = 'a@b.c'").unwrap();
    let out = optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    let Plan::Fast(FastPlan::PointGet(p)) = &out.plan else {
        panic!("expected point get, got {:?}", out.plan);
    };
    assert_eq!(p.index.as_ref().map(|i| i.name.as_str()), Some("uk_email"));
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);
    assert!(!s.has_pending_txn_future());
    tokio::task::yield_now().await;
    assert_eq!(oracle.calls(), 0);
}

#[tokio::test]
async fn timestamp_is_deferred_inside_transactions_and_for_batches() {
    let snap = snapshot();
    let point = parse_one("SELECT name FROM users WHERE id = 7").unwrap();

    let mut s = session();
    s.vars.in_txn = true;
    let out = optimize(&ctx(), &mut s, &point, &snap).await.unwrap();
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);

    let mut s = session();
    s.vars.autocommit = false;
    let out = optimize(&ctx(), &mut s, &point, &snap).await.unwrap();
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);

    let mut s = session();
    let batch = parse_one("SELECT name FROM users WHERE id IN (1, 2, 3)").unwrap();
    let out = optimize(&ctx(), &mut s, &batch, &snap).await.unwrap();
    assert!(matches!(out.plan, Plan::Fast(FastPlan::BatchPointGet(_))));
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);
    assert!(!s.has_pending_txn_future());
}

#[tokio::test]
async fn point_update_is_fast_and_restores_engines() {
    let snap = snapshot();
    let mut s = session();
    let node = parse_one("UPDATE users SET name = 'x' WHERE id = 1").unwrap();
    let out = optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    assert_eq!(out.path, PlanPath::Fast);
    assert!(matches!(out.plan, Plan::Fast(FastPlan::Update { .. })));
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);
    assert!(has_analytic(&s));
}

#[tokio::test]
async fn missing_grant_is_denied_on_both_paths() {
    let snap = snapshot();
    let app = RoleIdentity::new("app", "%");
    let grants = Arc::new(GrantTable::new());
    let mut s = session().with_privilege_manager(grants.clone());
    s.vars.active_roles = vec![app.clone()];

    let point = parse_one("SELECT name FROM users WHERE id = 1").unwrap();
    let err = optimize(&ctx(), &mut s, &point, &snap).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PrivilegeDenied);
    assert!(!s.has_pending_txn_future());

    grants.grant(&app, Privilege::Select, "main", "users");
    optimize(&ctx(), &mut s, &point, &snap).await.unwrap();

    let join = parse_one("SELECT u.name, o.amount FROM users u JOIN orders o ON u.id = o.user_id")
        .unwrap();
    match optimize(&ctx(), &mut s, &join, &snap).await.unwrap_err() {
        KeelError::PrivilegeDenied { privilege, object, .. } => {
            assert_eq!(privilege, "SELECT");
            assert_eq!(object, "main.orders");
        }
        other => panic!("expected privilege error, got {other:?}"),
    }
}

#[tokio::test]
async fn session_control_passes_through_unoptimized() {
    let snap = snapshot();
    let mut s = session().with_privilege_manager(Arc::new(GrantTable::new()));
    s.vars.active_roles = vec![RoleIdentity::new("app", "%")];
    let node = parse_one("BEGIN").unwrap();
    let out = optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    assert_eq!(out.path, PlanPath::NonLogical);
    assert!(matches!(out.plan, Plan::NonLogical(_)));
}

#[tokio::test]
async fn locked_tables_reject_conflicting_access() {
    let mut cat = catalog();
    cat.set_table_lock(
        "main",
        "users",
        Some(TableLock {
            mode: TableLockMode::Write,
            holder: SessionId(2),
        }),
    )
    .unwrap();
    let snap = cat.snapshot();
    let mut s = session();
    let scan = parse_one("SELECT name FROM users WHERE name = 'x'").unwrap();
    let err = optimize(&ctx(), &mut s, &scan, &snap).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TableLocked);

    cat.set_table_lock(
        "main",
        "users",
        Some(TableLock {
            mode: TableLockMode::Read,
            holder: SessionId(1),
        }),
    )
    .unwrap();
    let snap = cat.snapshot();
    optimize(&ctx(), &mut s, &scan, &snap).await.unwrap();
    let write = parse_one("UPDATE users SET name = 'y' WHERE name = 'x'").unwrap();
    let err = optimize(&ctx(), &mut s, &write, &snap).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TableLocked);
    assert!(has_analytic(&s));
}

#[tokio::test]
async fn both_backends_produce_physical_plans() {
    let snap = snapshot();
    let join = parse_one("SELECT u.name, o.amount FROM users u JOIN orders o ON u.id = o.user_id")
        .unwrap();

    let mut s = session();
    let rules = optimize(&ctx(), &mut s, &join, &snap).await.unwrap();
    assert_eq!(rules.path, PlanPath::RulePipeline);
    assert!(matches!(rules.plan, Plan::Physical(_)));

    s.vars.optimizer_backend = OptimizerBackend::Cascades;
    let memo = optimize(&ctx(), &mut s, &join, &snap).await.unwrap();
    assert_eq!(memo.path, PlanPath::Cascades);
    let text = explain(&memo.plan);
    assert!(text.contains("HashJoin"), "{text}");
    assert_eq!(
        s.vars.stmt_ctx.referenced_tables,
        vec![TableKey::new("main", "users"), TableKey::new("main", "orders")]
    );
}

#[tokio::test]
async fn builder_ids_start_fresh_after_fast_path_miss() {
    let snap = snapshot();
    let sql = "SELECT name FROM users WHERE name = 'x'";

    let mut ids = IdAllocator::new();
    PlanBuilder::new(&snap, "main", &mut ids)
        .build(&parse_one(sql).unwrap())
        .unwrap();
    assert!(ids.column_ids_allocated() > 0);

    let mut s = session();
    let node = parse_one(sql).unwrap();
    for _ in 0..2 {
        optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
        assert_eq!(s.vars.plan_ids.column_ids_allocated(), ids.column_ids_allocated());
        assert_eq!(s.vars.plan_ids.plan_ids_allocated(), ids.plan_ids_allocated());
    }
}

#[tokio::test]
async fn each_concurrent_statement_gets_its_own_timestamp() {
    let snap = snapshot();
    let oracle = CountingOracle::new();
    let mut s = session().with_oracle(oracle.clone());
    let first = parse_one("SELECT name FROM users WHERE id = 1").unwrap();
    let second = parse_one("SELECT name FROM users WHERE id = 2").unwrap();

    let out = optimize(&ctx(), &mut s, &first, &snap).await.unwrap();
    assert_eq!(out.timestamp, TimestampAcquisition::Concurrent);
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert_eq!(oracle.calls(), 1);

    let out = optimize(&ctx(), &mut s, &second, &snap).await.unwrap();
    assert_eq!(out.timestamp, TimestampAcquisition::Concurrent);
    s.take_txn_future().unwrap().wait().await.unwrap();
    assert_eq!(oracle.calls(), 2);
}

#[tokio::test]
async fn deferred_statement_drops_leftover_timestamp_request() {
    let snap = snapshot();
    let mut s = session();
    let point = parse_one("SELECT name FROM users WHERE id = 1").unwrap();
    optimize(&ctx(), &mut s, &point, &snap).await.unwrap();
    assert!(s.has_pending_txn_future());

    let scan = parse_one("SELECT name FROM users WHERE name = 'x'").unwrap();
    let out = optimize(&ctx(), &mut s, &scan, &snap).await.unwrap();
    assert_eq!(out.timestamp, TimestampAcquisition::Deferred);
    assert!(!s.has_pending_txn_future());
}

#[tokio::test]
async fn explain_needs_the_privileges_of_the_explained_statement() {
    let snap = snapshot();
    let app = RoleIdentity::new("app", "%");
    let grants = Arc::new(GrantTable::new());
    let mut s = session().with_privilege_manager(grants.clone());
    s.vars.active_roles = vec![app.clone()];
    let node = parse_one("EXPLAIN SELECT amount FROM orders WHERE region = 1").unwrap();

    match optimize(&ctx(), &mut s, &node, &snap).await.unwrap_err() {
        KeelError::PrivilegeDenied { object, .. } => assert_eq!(object, "main.orders"),
        other => panic!("expected privilege error, got {other:?}"),
    }

    grants.grant(&app, Privilege::Select, "main", "orders");
    let out = optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    assert_eq!(out.path, PlanPath::NonLogical);
    assert_eq!(
        s.vars.stmt_ctx.referenced_tables,
        vec![TableKey::new("main", "orders")]
    );
}

#[tokio::test]
async fn explain_respects_table_locks() {
    let mut cat = catalog();
    cat.set_table_lock(
        "main",
        "orders",
        Some(TableLock {
            mode: TableLockMode::Write,
            holder: SessionId(2),
        }),
    )
    .unwrap();
    let snap = cat.snapshot();
    let mut s = session();
    let node = parse_one("EXPLAIN SELECT amount FROM orders WHERE region = 1").unwrap();
    let err = optimize(&ctx(), &mut s, &node, &snap).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TableLocked);
}

#[tokio::test]
async fn outcomes_are_counted_per_path() {
    let snap = snapshot();
    let mut s = session();
    let node = parse_one("SELECT name FROM users WHERE id = 3").unwrap();
    optimize(&ctx(), &mut s, &node, &snap).await.unwrap();
    let text = keel_common::metrics::global_metrics().render_prometheus();
    assert!(text.contains("keel_planner_plans_total{path=\"fast\"}"), "{text}");
}
