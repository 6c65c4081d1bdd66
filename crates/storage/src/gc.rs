//! Snapshot consistency guard.
//!
//! Historical reads are only safe while the versions they need have not been
//! reclaimed. The GC worker persists its progress as the `gc_safe_point`
//! system variable; any snapshot older than that point must be refused.
//! The `gc_enable` variable switches reclamation on and off.
//!
//! Every operation takes a [`CancellationToken`] and returns
//! [`KeelError::Cancelled`] as soon as it fires, even while a system query is
//! in flight.

use std::future::Future;

use keel_common::metrics::global_metrics;
use keel_common::ts::parse_gc_time;
use keel_common::{KeelError, Result, Timestamp};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::system_table::{RestrictedSqlExecutor, SystemRow, SELECT_VARIABLE_SQL, UPSERT_VARIABLE_SQL};

pub const GC_ENABLE_VAR: &str = "gc_enable";
pub const GC_SAFE_POINT_VAR: &str = "gc_safe_point";

const GC_ENABLE_COMMENT: &str = "Current GC enable status";
const GC_SAFE_POINT_COMMENT: &str =
    "All versions after safe point can be accessed. (DO NOT EDIT)";

/// Whether GC is currently enabled.
///
/// A missing `gc_enable` row is reported as [`KeelError::InvalidConfig`].
pub async fn check_gc_enable(
    cancel: &CancellationToken,
    exec: &dyn RestrictedSqlExecutor,
) -> Result<bool> {
    let value = read_single_variable(cancel, exec, GC_ENABLE_VAR)
        .await
        .map_err(|e| match e {
            KeelError::SafePointUnavailable(name) => {
                KeelError::InvalidConfig(format!("system variable '{name}' is not set"))
            }
            other => other,
        })?;
    Ok(value.trim().eq_ignore_ascii_case("true"))
}

/// Turn GC on. Idempotent.
pub async fn enable_gc(cancel: &CancellationToken, exec: &dyn RestrictedSqlExecutor) -> Result<()> {
    set_gc_enable(cancel, exec, true).await
}

/// Turn GC off. Idempotent.
pub async fn disable_gc(cancel: &CancellationToken, exec: &dyn RestrictedSqlExecutor) -> Result<()> {
    set_gc_enable(cancel, exec, false).await
}

async fn set_gc_enable(
    cancel: &CancellationToken,
    exec: &dyn RestrictedSqlExecutor,
    enabled: bool,
) -> Result<()> {
    let value = if enabled { "true" } else { "false" };
    upsert_variable(cancel, exec, GC_ENABLE_VAR, value, GC_ENABLE_COMMENT).await?;
    global_metrics().inc_gc_toggles(enabled);
    info!(operator = "GcGuard", gc_enable = enabled, "gc switch updated");
    Ok(())
}

/// Current GC safe point.
///
/// # Errors
/// - [`KeelError::SafePointUnavailable`] when the variable has zero or
///   several rows
/// - [`KeelError::InvalidConfig`] when the stored time cannot be parsed
pub async fn get_gc_safe_point(
    cancel: &CancellationToken,
    exec: &dyn RestrictedSqlExecutor,
) -> Result<Timestamp> {
    let value = read_single_variable(cancel, exec, GC_SAFE_POINT_VAR).await?;
    let t = parse_gc_time(&value)?;
    Ok(Timestamp::from_datetime(&t))
}

/// Refuse `snapshot_ts` if it is older than the current safe point.
pub async fn validate_snapshot(
    cancel: &CancellationToken,
    exec: &dyn RestrictedSqlExecutor,
    snapshot_ts: Timestamp,
) -> Result<()> {
    let safe_point = get_gc_safe_point(cancel, exec).await?;
    validate_snapshot_with_safe_point(snapshot_ts, safe_point)
}

/// Pure comparison against a known safe point.
pub fn validate_snapshot_with_safe_point(snapshot_ts: Timestamp, safe_point: Timestamp) -> Result<()> {
    if snapshot_ts < safe_point {
        global_metrics().inc_snapshot_rejections();
        warn!(
            operator = "GcGuard",
            snapshot_ts = %snapshot_ts,
            safe_point = %safe_point,
            "snapshot rejected: older than gc safe point"
        );
        return Err(KeelError::SnapshotTooOld {
            safe_point: safe_point.to_gc_time_string(),
        });
    }
    Ok(())
}

/// Move the safe point forward to `new_point`.
///
/// The safe point never moves backwards: when the stored point is already at
/// or after `new_point` this is a no-op. Returns the effective safe point.
pub async fn advance_gc_safe_point(
    cancel: &CancellationToken,
    exec: &dyn RestrictedSqlExecutor,
    new_point: Timestamp,
) -> Result<Timestamp> {
    let current = match get_gc_safe_point(cancel, exec).await {
        Ok(ts) => Some(ts),
        Err(KeelError::SafePointUnavailable(_)) => None,
        Err(e) => return Err(e),
    };
    if let Some(current) = current {
        // Persisted precision is one second; compare at that granularity.
        if current.physical_ms() / 1000 >= new_point.physical_ms() / 1000 {
            debug!(
                operator = "GcGuard",
                current = %current,
                requested = %new_point,
                "gc safe point already past requested point"
            );
            return Ok(current);
        }
    }
    let rendered = new_point.to_gc_time_string();
    upsert_variable(cancel, exec, GC_SAFE_POINT_VAR, &rendered, GC_SAFE_POINT_COMMENT).await?;
    info!(operator = "GcGuard", safe_point = %rendered, "gc safe point advanced");
    get_gc_safe_point(cancel, exec).await
}

async fn read_single_variable(
    cancel: &CancellationToken,
    exec: &dyn RestrictedSqlExecutor,
    name: &str,
) -> Result<String> {
    let args = [name.to_string()];
    let rows = run_cancellable(cancel, exec.exec_restricted_sql(SELECT_VARIABLE_SQL, &args)).await?;
    single_value(rows, name)
}

fn single_value(rows: Vec<SystemRow>, name: &str) -> Result<String> {
    match rows.as_slice() {
        [row] => row
            .get_string(0)
            .map(str::to_string)
            .ok_or_else(|| KeelError::SafePointUnavailable(name.to_string())),
        _ => {
            debug!(
                operator = "GcGuard",
                variable = name,
                rows = rows.len(),
                "expected exactly one row"
            );
            Err(KeelError::SafePointUnavailable(name.to_string()))
        }
    }
}

async fn upsert_variable(
    cancel: &CancellationToken,
    exec: &dyn RestrictedSqlExecutor,
    name: &str,
    value: &str,
    comment: &str,
) -> Result<()> {
    let args = [
        name.to_string(),
        value.to_string(),
        comment.to_string(),
        value.to_string(),
        comment.to_string(),
    ];
    run_cancellable(cancel, exec.exec_restricted_sql(UPSERT_VARIABLE_SQL, &args)).await?;
    Ok(())
}

async fn run_cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(KeelError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KeelError::Cancelled),
        res = fut => res,
    }
}
