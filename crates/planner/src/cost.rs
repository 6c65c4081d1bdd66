//! Cost model and access path enumeration.
//!
//! Costs are abstract units roughly proportional to bytes moved. Row
//! estimates use table statistics when present, pseudo statistics otherwise.

use std::collections::BTreeSet;

use keel_common::{KeelError, Result, StorageEngine};
use keel_storage::{SchemaSnapshot, TableDef};
use tracing::{debug, warn};

use crate::hints::TableHints;
use crate::logical_plan::{
    combine_conjuncts, equality_conditions, split_conjuncts, strip_qual, BinaryOp, Expr, PlanColumn,
};
use crate::physical_plan::{
    CoalesceBatchesExec, FilterExec, IndexLookupExec, PhysicalPlan, TableScanExec,
};
use crate::plan::{IndexAccess, PointGetPlan};

/// Per byte read sequentially from the row store.
pub const ROW_SCAN_BYTE: f64 = 1.0;
/// Per byte read from the columnar replica.
pub const COLUMNAR_SCAN_BYTE: f64 = 0.3;
/// Per index entry visited.
pub const INDEX_ENTRY: f64 = 8.0;
/// Per primary row fetched after an index match.
pub const ROW_LOOKUP: f64 = 24.0;
/// Fixed cost of a point access.
pub const POINT_GET: f64 = 4.0;
/// Per row evaluated by filters, projections and aggregates.
pub const CPU_ROW: f64 = 0.2;
/// Per row inserted into a hash table.
pub const HASH_BUILD_ROW: f64 = 2.0;
/// Per row probing a hash table.
pub const HASH_PROBE_ROW: f64 = 1.0;
/// Per byte crossing an exchange.
pub const NETWORK_BYTE: f64 = 1.5;

const EQ_SELECTIVITY: f64 = 0.01;
const RANGE_SELECTIVITY: f64 = 0.33;
const DEFAULT_COLUMN_BYTES: usize = 16;

/// Estimated output and accumulated cost of a (sub)plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub rows: f64,
    pub row_bytes: f64,
    pub total: f64,
}

impl Cost {
    pub fn new(rows: f64, row_bytes: f64, total: f64) -> Self {
        Self {
            rows: rows.max(1.0),
            row_bytes: row_bytes.max(1.0),
            total,
        }
    }

    pub fn bytes(&self) -> f64 {
        self.rows * self.row_bytes
    }
}

/// What the physical planners need to know besides the plan itself.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalContext<'a> {
    pub snapshot: &'a SchemaSnapshot,
    /// Engines the session may read from.
    pub engines: &'a BTreeSet<StorageEngine>,
    pub broadcast_threshold_bytes: u64,
    pub shuffle_partitions: usize,
    pub target_batch_rows: usize,
}

/// A table scan as seen by access path selection.
#[derive(Debug, Clone, Copy)]
pub struct ScanRef<'p> {
    pub db: &'p str,
    pub table: &'p str,
    pub qualifier: &'p str,
    pub columns: &'p [PlanColumn],
    pub projection: Option<&'p [String]>,
    pub filters: &'p [Expr],
    pub hints: &'p TableHints,
    /// Plan id reused by point accesses.
    pub id: keel_common::PlanId,
}

/// Engines a scan may use: the session's eligible engines that hold a
/// replica, narrowed by `read_from_storage` when the hinted engine is among
/// them.
pub fn scan_engines(
    ctx: &PhysicalContext<'_>,
    def: &TableDef,
    hints: &TableHints,
) -> Vec<StorageEngine> {
    let engines = ctx
        .engines
        .iter()
        .copied()
        .filter(|e| def.has_replica(*e))
        .collect::<Vec<_>>();
    match hints.read_from_storage {
        Some(hinted) if engines.contains(&hinted) => vec![hinted],
        Some(hinted) => {
            warn!(
                operator = "AccessPath",
                table = %def.qualified_name(),
                engine = %hinted,
                "read_from_storage names an ineligible engine, hint ignored"
            );
            engines
        }
        None => engines,
    }
}

/// Every valid way to read `scan`, each with its cost. Fails with
/// `NoPlanFound` when none exists.
pub fn access_paths(
    ctx: &PhysicalContext<'_>,
    scan: ScanRef<'_>,
) -> Result<Vec<(PhysicalPlan, Cost)>> {
    let def = ctx.snapshot.table(scan.db, scan.table)?;
    let engines = scan_engines(ctx, def, scan.hints);
    let rows = def.stats.row_count() as f64;
    let row_bytes = def.stats.avg_row_bytes() as f64;
    let conjuncts = scan
        .filters
        .iter()
        .cloned()
        .flat_map(split_conjuncts)
        .collect::<Vec<_>>();
    let out_rows = rows * filter_selectivity(&conjuncts);
    let projection = scan.projection.map(|p| p.to_vec());
    let mut paths = vec![];

    // use_index disables full table scans.
    if scan.hints.use_index.is_empty() {
        for engine in &engines {
            let total = match engine {
                StorageEngine::Transactional => rows * row_bytes * ROW_SCAN_BYTE,
                StorageEngine::AnalyticReplica => {
                    rows * projected_width(def, scan.projection) * COLUMNAR_SCAN_BYTE
                }
            } + rows * CPU_ROW;
            let mut plan = PhysicalPlan::TableScan(TableScanExec {
                db: def.db.clone(),
                table: def.name.clone(),
                qualifier: scan.qualifier.to_string(),
                engine: *engine,
                projection: projection.clone(),
                filters: scan.filters.to_vec(),
            });
            if *engine == StorageEngine::AnalyticReplica && !scan.filters.is_empty() {
                plan = PhysicalPlan::CoalesceBatches(CoalesceBatchesExec {
                    target_batch_rows: ctx.target_batch_rows,
                    input: Box::new(plan),
                });
            }
            paths.push((plan, Cost::new(out_rows, row_bytes, total)));
        }
    }

    if engines.contains(&StorageEngine::Transactional) {
        let eqs = equality_conditions(&conjuncts);
        let lookup = |col: &str| {
            eqs.iter()
                .find(|(c, _)| c.eq_ignore_ascii_case(col))
                .map(|(_, v)| v.clone())
        };

        if !def.primary_key.is_empty() && scan.hints.allows_index("primary") {
            let key = def
                .primary_key
                .iter()
                .map(|c| lookup(c).map(|v| (c.clone(), v)))
                .collect::<Option<Vec<_>>>();
            if let Some(key) = key {
                let point = PhysicalPlan::PointGet(PointGetPlan {
                    id: scan.id,
                    db: def.db.clone(),
                    table: def.name.clone(),
                    table_id: def.id,
                    index: None,
                    key,
                    columns: projected_columns(scan),
                    lock: false,
                });
                let residual = conjuncts
                    .iter()
                    .filter(|c| !is_key_equality(c, &def.primary_key))
                    .cloned()
                    .collect::<Vec<_>>();
                let plan = if residual.is_empty() {
                    point
                } else {
                    PhysicalPlan::Filter(FilterExec {
                        predicate: combine_conjuncts(residual),
                        input: Box::new(point),
                    })
                };
                paths.push((
                    plan,
                    Cost::new(1.0, row_bytes, POINT_GET + row_bytes * ROW_SCAN_BYTE),
                ));
            }
        }

        for index in def.indexes.iter().filter(|i| scan.hints.allows_index(&i.name)) {
            let key = index
                .columns
                .iter()
                .map_while(|c| lookup(c).map(|v| (c.clone(), v)))
                .collect::<Vec<_>>();
            let forced = scan
                .hints
                .use_index
                .iter()
                .any(|n| n.eq_ignore_ascii_case(&index.name));
            if key.is_empty() && !forced {
                continue;
            }
            let matched = if index.unique && key.len() == index.columns.len() {
                1.0
            } else {
                rows * EQ_SELECTIVITY.powi(key.len() as i32)
            };
            let total = matched * (INDEX_ENTRY + ROW_LOOKUP + row_bytes * ROW_SCAN_BYTE)
                + matched * CPU_ROW;
            let out = (matched * filter_selectivity(&conjuncts) / key_selectivity(key.len()))
                .min(matched);
            paths.push((
                PhysicalPlan::IndexLookup(IndexLookupExec {
                    db: def.db.clone(),
                    table: def.name.clone(),
                    qualifier: scan.qualifier.to_string(),
                    index: IndexAccess {
                        id: index.id,
                        name: index.name.clone(),
                    },
                    key,
                    filters: scan.filters.to_vec(),
                    projection: projection.clone(),
                }),
                Cost::new(out, row_bytes, total),
            ));
        }
    }

    if paths.is_empty() {
        return Err(KeelError::NoPlanFound(format!(
            "no access path for {} on engines [{}]",
            def.qualified_name(),
            engines
                .iter()
                .map(|e| e.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    debug!(
        operator = "AccessPath",
        table = %def.qualified_name(),
        candidates = paths.len(),
        "enumerated access paths"
    );
    Ok(paths)
}

fn projected_columns(scan: ScanRef<'_>) -> Vec<PlanColumn> {
    scan.columns
        .iter()
        .filter(|c| {
            scan.projection
                .map_or(true, |p| p.iter().any(|n| n.eq_ignore_ascii_case(&c.name)))
        })
        .cloned()
        .collect()
}

/// `key_col = constant` for one of `key`.
fn is_key_equality(e: &Expr, key: &[String]) -> bool {
    match e {
        Expr::BinaryOp {
            left,
            op: BinaryOp::Eq,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (Expr::Column(c), v) | (v, Expr::Column(c)) if v.is_constant() => key
                .iter()
                .any(|k| k.eq_ignore_ascii_case(strip_qual(c))),
            _ => false,
        },
        _ => false,
    }
}

fn key_selectivity(key_len: usize) -> f64 {
    EQ_SELECTIVITY.powi(key_len as i32)
}

/// Combined selectivity of independent conjuncts.
pub fn filter_selectivity(conjuncts: &[Expr]) -> f64 {
    conjuncts
        .iter()
        .map(|c| match c {
            Expr::BinaryOp {
                op: BinaryOp::Eq, ..
            } => EQ_SELECTIVITY,
            Expr::InList { list, negated, .. } if !negated => {
                (EQ_SELECTIVITY * list.len() as f64).min(1.0)
            }
            Expr::Literal(_) => 1.0,
            _ => RANGE_SELECTIVITY,
        })
        .product()
}

/// Bytes per row of the projected columns, from their arrow types.
fn projected_width(def: &TableDef, projection: Option<&[String]>) -> f64 {
    let schema = def.arrow_schema();
    schema
        .fields()
        .iter()
        .filter(|f| projection.map_or(true, |p| p.iter().any(|c| c.eq_ignore_ascii_case(f.name()))))
        .map(|f| f.data_type().primitive_width().unwrap_or(DEFAULT_COLUMN_BYTES))
        .sum::<usize>()
        .max(1) as f64
}
