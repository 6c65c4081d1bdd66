use std::fmt;

use arrow_schema::DataType;
use keel_common::{ColumnId, PlanId};
use serde::{Deserialize, Serialize};

use crate::hints::TableHints;

/// Scalar expression. Column references are qualified (`alias.column`) once
/// the builder has resolved them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(String),
    Literal(LiteralValue),
    /// Unbound parameter marker (`?` or `$n`).
    Placeholder(String),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn lit_i64(v: i64) -> Self {
        Expr::Literal(LiteralValue::Int64(v))
    }

    pub fn eq(self, other: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(self),
            op: BinaryOp::Eq,
            right: Box::new(other),
        }
    }

    /// Literal or parameter marker: a value known before execution starts.
    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::Placeholder(_))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{c}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Placeholder(p) => write!(f, "{p}"),
            Expr::BinaryOp { left, op, right } => write!(f, "({left} {op} {right})"),
            Expr::And(a, b) => write!(f, "({a} AND {b})"),
            Expr::Or(a, b) => write!(f, "({a} OR {b})"),
            Expr::Not(x) => write!(f, "NOT {x}"),
            Expr::IsNull(x) => write!(f, "{x} IS NULL"),
            Expr::IsNotNull(x) => write!(f, "{x} IS NOT NULL"),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let items = list
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let not = if *negated { " NOT" } else { "" };
                write!(f, "{expr}{not} IN ({items})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Int64(v) => write!(f, "{v}"),
            LiteralValue::Float64(v) => write!(f, "{v}"),
            LiteralValue::Utf8(v) => write!(f, "'{v}'"),
            LiteralValue::Boolean(v) => write!(f, "{v}"),
            LiteralValue::Null => write!(f, "NULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggExpr {
    Count(Expr),
    Sum(Expr),
    Min(Expr),
    Max(Expr),
    Avg(Expr),
}

impl AggExpr {
    pub fn arg(&self) -> &Expr {
        match self {
            AggExpr::Count(e)
            | AggExpr::Sum(e)
            | AggExpr::Min(e)
            | AggExpr::Max(e)
            | AggExpr::Avg(e) => e,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggExpr::Count(_) => "COUNT",
            AggExpr::Sum(_) => "SUM",
            AggExpr::Min(_) => "MIN",
            AggExpr::Max(_) => "MAX",
            AggExpr::Avg(_) => "AVG",
        }
    }
}

impl fmt::Display for AggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.arg())
    }
}

/// Join distribution preference carried from hints or the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStrategyHint {
    Auto,
    BroadcastLeft,
    BroadcastRight,
    Shuffle,
}

/// Output column of a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanColumn {
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    TableScan {
        id: PlanId,
        db: String,
        table: String,
        /// Name the columns are qualified with (alias or table name).
        qualifier: String,
        columns: Vec<PlanColumn>,
        /// Columns actually needed, filled by column pruning.
        projection: Option<Vec<String>>,
        /// Conjuncts pushed into the scan.
        filters: Vec<Expr>,
        hints: TableHints,
    },
    /// Constant rows (`INSERT ... VALUES`, `SELECT` without `FROM`).
    Values {
        id: PlanId,
        columns: Vec<PlanColumn>,
        rows: Vec<Vec<Expr>>,
    },
    Projection {
        id: PlanId,
        exprs: Vec<(Expr, PlanColumn)>,
        input: Box<LogicalPlan>,
    },
    Filter {
        id: PlanId,
        predicate: Expr,
        input: Box<LogicalPlan>,
    },
    /// Inner equi-join.
    Join {
        id: PlanId,
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        on: Vec<(String, String)>,
        strategy_hint: JoinStrategyHint,
    },
    Aggregate {
        id: PlanId,
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<(AggExpr, PlanColumn)>,
        input: Box<LogicalPlan>,
    },
    Limit {
        id: PlanId,
        n: usize,
        input: Box<LogicalPlan>,
    },
    Insert {
        id: PlanId,
        db: String,
        table: String,
        columns: Vec<String>,
        /// `ON DUPLICATE KEY UPDATE` assignments.
        on_duplicate: Vec<(String, Expr)>,
        input: Box<LogicalPlan>,
    },
    Update {
        id: PlanId,
        db: String,
        table: String,
        assignments: Vec<(String, Expr)>,
        input: Box<LogicalPlan>,
    },
    Delete {
        id: PlanId,
        db: String,
        table: String,
        input: Box<LogicalPlan>,
    },
}

impl LogicalPlan {
    pub fn id(&self) -> PlanId {
        match self {
            LogicalPlan::TableScan { id, .. }
            | LogicalPlan::Values { id, .. }
            | LogicalPlan::Projection { id, .. }
            | LogicalPlan::Filter { id, .. }
            | LogicalPlan::Join { id, .. }
            | LogicalPlan::Aggregate { id, .. }
            | LogicalPlan::Limit { id, .. }
            | LogicalPlan::Insert { id, .. }
            | LogicalPlan::Update { id, .. }
            | LogicalPlan::Delete { id, .. } => *id,
        }
    }

    pub fn children(&self) -> Vec<&LogicalPlan> {
        match self {
            LogicalPlan::TableScan { .. } | LogicalPlan::Values { .. } => vec![],
            LogicalPlan::Join { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            LogicalPlan::Projection { input, .. }
            | LogicalPlan::Filter { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::Insert { input, .. }
            | LogicalPlan::Update { input, .. }
            | LogicalPlan::Delete { input, .. } => vec![input.as_ref()],
        }
    }

    /// Names of the columns this node produces.
    pub fn output_names(&self) -> Vec<String> {
        match self {
            LogicalPlan::TableScan {
                qualifier, columns, ..
            } => columns
                .iter()
                .map(|c| format!("{qualifier}.{}", c.name))
                .collect(),
            LogicalPlan::Values { columns, .. } => columns.iter().map(|c| c.name.clone()).collect(),
            LogicalPlan::Projection { exprs, .. } => {
                exprs.iter().map(|(_, c)| c.name.clone()).collect()
            }
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                ..
            } => group_exprs
                .iter()
                .map(|e| e.to_string())
                .chain(aggr_exprs.iter().map(|(_, c)| c.name.clone()))
                .collect(),
            LogicalPlan::Join { left, right, .. } => {
                let mut out = left.output_names();
                out.extend(right.output_names());
                out
            }
            LogicalPlan::Filter { input, .. } | LogicalPlan::Limit { input, .. } => {
                input.output_names()
            }
            LogicalPlan::Insert { .. } | LogicalPlan::Update { .. } | LogicalPlan::Delete { .. } => {
                vec![]
            }
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            LogicalPlan::Insert { .. } | LogicalPlan::Update { .. } | LogicalPlan::Delete { .. }
        )
    }
}

/// Split `a AND b AND c` into its conjuncts.
pub fn split_conjuncts(e: Expr) -> Vec<Expr> {
    match e {
        Expr::And(a, b) => {
            let mut v = split_conjuncts(*a);
            v.extend(split_conjuncts(*b));
            v
        }
        other => vec![other],
    }
}

pub fn combine_conjuncts(mut v: Vec<Expr>) -> Expr {
    if v.is_empty() {
        return Expr::Literal(LiteralValue::Boolean(true));
    }
    let first = v.remove(0);
    v.into_iter()
        .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e)))
}

/// Column names referenced by `e`.
pub fn expr_columns(e: &Expr) -> Vec<String> {
    let mut out = vec![];
    collect_cols(e, &mut out);
    out
}

fn collect_cols(e: &Expr, out: &mut Vec<String>) {
    match e {
        Expr::Column(c) => {
            if !out.contains(c) {
                out.push(c.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
            collect_cols(left, out);
            collect_cols(right, out);
        }
        Expr::Not(x) | Expr::IsNull(x) | Expr::IsNotNull(x) => collect_cols(x, out),
        Expr::InList { expr, list, .. } => {
            collect_cols(expr, out);
            for item in list {
                collect_cols(item, out);
            }
        }
        Expr::Literal(_) | Expr::Placeholder(_) => {}
    }
}

/// Column part of a possibly qualified name.
pub fn strip_qual(s: &str) -> &str {
    match s.rsplit_once('.') {
        Some((_, c)) => c,
        None => s,
    }
}

/// `column = constant` pairs among `conjuncts`, keyed by unqualified column.
pub fn equality_conditions(conjuncts: &[Expr]) -> Vec<(String, Expr)> {
    conjuncts
        .iter()
        .filter_map(|c| match c {
            Expr::BinaryOp {
                left,
                op: BinaryOp::Eq,
                right,
            } => match (left.as_ref(), right.as_ref()) {
                (Expr::Column(col), v) | (v, Expr::Column(col)) if v.is_constant() => {
                    Some((strip_qual(col).to_string(), v.clone()))
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}
