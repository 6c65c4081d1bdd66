#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow_schema::DataType;
use async_trait::async_trait;
use keel_client::{LocalOracle, Session, TimestampOracle};
use keel_common::{PlannerConfig, Result, SessionId, StorageEngine, Timestamp};
use keel_sql::ast::{Expr, Value};
use keel_storage::{Catalog, SchemaSnapshot, TableDef};
use tracing_subscriber::EnvFilter;

/// Filter with `RUST_LOG`; warnings only by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `users` is keyed by `id` with a unique `email` index; `orders` is large
/// and has a columnar replica.
pub fn catalog() -> Catalog {
    let mut cat = Catalog::new();
    cat.register_table(
        TableDef::new(1, "main", "users")
            .with_column("id", DataType::Int64)
            .with_column("email", DataType::Utf8)
            .with_column("name", DataType::Utf8)
            .with_primary_key(&["id"])
            .with_index("uk_email", &["email"], true)
            .with_stats(100_000, 6_400_000),
    )
    .unwrap();
    cat.register_table(
        TableDef::new(2, "main", "orders")
            .with_column("id", DataType::Int64)
            .with_column("user_id", DataType::Int64)
            .with_column("region", DataType::Int64)
            .with_column("amount", DataType::Int64)
            .with_primary_key(&["id"])
            .with_stats(10_000_000, 640_000_000)
            .with_replica(StorageEngine::AnalyticReplica),
    )
    .unwrap();
    cat
}

pub fn snapshot() -> SchemaSnapshot {
    catalog().snapshot()
}

pub fn session() -> Session {
    init_tracing();
    Session::new(SessionId(1), &PlannerConfig::default())
}

pub fn int(v: i64) -> Expr {
    Expr::Value(Value::Number(v.to_string(), false))
}

/// Oracle that counts requests.
#[derive(Debug, Default)]
pub struct CountingOracle {
    inner: LocalOracle,
    calls: AtomicUsize,
}

impl CountingOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimestampOracle for CountingOracle {
    async fn get_timestamp(&self) -> Result<Timestamp> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_timestamp().await
    }
}
