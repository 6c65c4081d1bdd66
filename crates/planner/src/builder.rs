//! AST to logical plan translation.
//!
//! Besides the plan, building collects everything the validators need:
//! privilege obligations ([`VisitRecord`]s) in visit order, the ordered
//! de-duplicated list of referenced tables, and the rewrite rules worth
//! running ([`OptFlags`]).

use arrow_schema::DataType;
use keel_common::{KeelError, Result};
use keel_sql::ast::{
    Assignment, AssignmentTarget, BinaryOperator as SqlBinaryOp, Delete, Expr as SqlExpr,
    FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Ident, Insert,
    JoinConstraint, JoinOperator, ObjectName, OnInsert, Query, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins, UnaryOperator, Value,
};
use keel_sql::StmtNode;
use keel_storage::{SchemaSnapshot, TableDef, TableKey};
use tracing::debug;

use crate::hints::{BlockHintProcessor, HintTable};
use crate::logical_plan::{
    expr_columns, strip_qual, AggExpr, BinaryOp, Expr, JoinStrategyHint, LiteralValue, LogicalPlan,
    PlanColumn,
};
use crate::plan::{ExecutePlan, IdAllocator, NonLogicalKind, NonLogicalPlan, OptFlags, Plan};
use crate::privilege::{Privilege, VisitRecord};

fn build_err(msg: impl Into<String>) -> KeelError {
    KeelError::PlanBuild(msg.into())
}

/// Resolve `name` / `db.name` against `current_db`.
pub fn resolve_table_name(name: &ObjectName, current_db: &str) -> Result<(String, String)> {
    match name.0.as_slice() {
        [table] => Ok((current_db.to_string(), table.value.clone())),
        [db, table] => Ok((db.value.clone(), table.value.clone())),
        _ => Err(build_err(format!("unsupported table name: {name}"))),
    }
}

pub struct PlanBuilder<'a> {
    snapshot: &'a SchemaSnapshot,
    current_db: &'a str,
    ids: &'a mut IdAllocator,
    hints: HintTable,
    block: usize,
    visits: Vec<VisitRecord>,
    tables: Vec<TableKey>,
    flags: OptFlags,
}

struct ScopeTable<'s> {
    qualifier: String,
    def: &'s TableDef,
}

#[derive(Default)]
struct Scope<'s> {
    tables: Vec<ScopeTable<'s>>,
}

impl<'s> Scope<'s> {
    fn resolve(&self, parts: &[Ident]) -> Result<(String, DataType)> {
        let (qualifier, column) = match parts {
            [c] => (None, c.value.as_str()),
            [.., q, c] => (Some(q.value.as_str()), c.value.as_str()),
            [] => return Err(build_err("empty column reference")),
        };
        let mut found = None;
        for t in &self.tables {
            if qualifier.is_some_and(|q| !q.eq_ignore_ascii_case(&t.qualifier)) {
                continue;
            }
            if let Some(col) = t.def.column(column) {
                if found.is_some() {
                    return Err(build_err(format!("column '{column}' is ambiguous")));
                }
                found = Some((format!("{}.{}", t.qualifier, col.name), col.data_type.clone()));
            }
        }
        found.ok_or_else(|| {
            let full = parts
                .iter()
                .map(|p| p.value.as_str())
                .collect::<Vec<_>>()
                .join(".");
            build_err(format!("unknown column '{full}'"))
        })
    }

    fn type_of(&self, qualified: &str) -> Option<DataType> {
        let (q, c) = qualified.rsplit_once('.')?;
        self.tables
            .iter()
            .find(|t| t.qualifier == q)
            .and_then(|t| t.def.column(c))
            .map(|c| c.data_type.clone())
    }
}

/// Aggregates found while converting a select list or HAVING clause.
type AggSink = Vec<(AggExpr, PlanColumn)>;

impl<'a> PlanBuilder<'a> {
    pub fn new(snapshot: &'a SchemaSnapshot, current_db: &'a str, ids: &'a mut IdAllocator) -> Self {
        Self {
            snapshot,
            current_db,
            ids,
            hints: HintTable::default(),
            block: 0,
            visits: vec![],
            tables: vec![],
            flags: OptFlags::default(),
        }
    }

    /// Privilege obligations of the last built statement, in visit order.
    pub fn visit_records(&self) -> &[VisitRecord] {
        &self.visits
    }

    /// Referenced tables of the last built statement, first reference first.
    pub fn referenced_tables(&self) -> &[TableKey] {
        &self.tables
    }

    pub fn opt_flags(&self) -> OptFlags {
        self.flags
    }

    pub fn hints(&self) -> &HintTable {
        &self.hints
    }

    pub fn build(&mut self, node: &StmtNode) -> Result<Plan> {
        self.visits.clear();
        self.tables.clear();
        self.flags = OptFlags::default();
        self.block = 0;
        match node {
            StmtNode::Execute(exec) => Ok(Plan::Execute(ExecutePlan::new(exec.clone()))),
            StmtNode::Other(stmt) => {
                self.hints = BlockHintProcessor::process(stmt);
                self.build_statement(stmt)
            }
        }
    }

    fn build_statement(&mut self, stmt: &Statement) -> Result<Plan> {
        let non_logical = |kind| {
            Ok(Plan::NonLogical(NonLogicalPlan {
                kind,
                statement: stmt.clone(),
            }))
        };
        match stmt {
            Statement::Query(q) => Ok(Plan::Logical(self.build_query(q)?)),
            Statement::Insert(insert) => {
                self.enter_block();
                Ok(Plan::Logical(self.build_insert(insert)?))
            }
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                returning,
                ..
            } => {
                if from.is_some() || returning.is_some() {
                    return Err(build_err("UPDATE ... FROM / RETURNING is not supported"));
                }
                self.enter_block();
                Ok(Plan::Logical(self.build_update(
                    table,
                    assignments,
                    selection.as_ref(),
                )?))
            }
            Statement::Delete(delete) => {
                self.enter_block();
                Ok(Plan::Logical(self.build_delete(delete)?))
            }
            Statement::Execute { .. } => match StmtNode::from(stmt.clone()) {
                StmtNode::Execute(exec) => Ok(Plan::Execute(ExecutePlan::new(exec))),
                StmtNode::Other(_) => Err(build_err("malformed EXECUTE statement")),
            },
            Statement::Prepare { .. } => non_logical(NonLogicalKind::Prepare),
            Statement::Deallocate { .. } => non_logical(NonLogicalKind::Deallocate),
            Statement::SetVariable { variables, .. } => {
                let global = variables.iter().any(|v| {
                    v.0.first()
                        .is_some_and(|p| p.value.to_ascii_lowercase().starts_with("@@global"))
                });
                if global {
                    self.visits.push(VisitRecord::global(Privilege::Super));
                }
                non_logical(NonLogicalKind::Set)
            }
            Statement::SetTimeZone { .. }
            | Statement::SetNames { .. }
            | Statement::SetTransaction { .. }
            | Statement::SetRole { .. } => non_logical(NonLogicalKind::Set),
            Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowCreate { .. }
            | Statement::ShowVariable { .. }
            | Statement::ShowVariables { .. }
            | Statement::ShowStatus { .. }
            | Statement::ShowFunctions { .. }
            | Statement::ShowCollation { .. }
            | Statement::ExplainTable { .. } => non_logical(NonLogicalKind::Show),
            Statement::StartTransaction { .. } => non_logical(NonLogicalKind::Begin),
            Statement::Commit { .. } => non_logical(NonLogicalKind::Commit),
            Statement::Rollback { .. } => non_logical(NonLogicalKind::Rollback),
            Statement::Use(_) => non_logical(NonLogicalKind::Use),
            Statement::Explain {
                analyze, statement, ..
            } => {
                if *analyze {
                    return Err(build_err("EXPLAIN ANALYZE is not supported"));
                }
                // Explaining reveals the plan, so it needs the same access as
                // running it: keep the visit records, drop the plan.
                self.build_statement(statement)?;
                non_logical(NonLogicalKind::Explain)
            }
            other => Err(build_err(format!(
                "unsupported statement: {}",
                statement_head(other)
            ))),
        }
    }

    fn enter_block(&mut self) {
        self.block += 1;
    }

    fn visit_table(&mut self, privilege: Privilege, def: &TableDef) {
        let record = VisitRecord::table(privilege, &def.db, &def.name);
        if !self.visits.contains(&record) {
            self.visits.push(record);
        }
        let key = TableKey::new(&def.db, &def.name);
        if !self.tables.contains(&key) {
            self.tables.push(key);
        }
    }

    fn column(&mut self, name: impl Into<String>, data_type: DataType) -> PlanColumn {
        PlanColumn {
            id: self.ids.next_column_id(),
            name: name.into(),
            data_type,
        }
    }

    fn lookup_table(&self, name: &ObjectName) -> Result<&'a TableDef> {
        let (db, table) = resolve_table_name(name, self.current_db)?;
        self.snapshot.table(&db, &table)
    }

    // -----------------------------
    // SELECT
    // -----------------------------

    fn build_query(&mut self, q: &Query) -> Result<LogicalPlan> {
        self.enter_block();
        if q.with.is_some() {
            return Err(build_err("WITH is not supported"));
        }
        if q.order_by.is_some() {
            return Err(build_err("ORDER BY is not supported"));
        }
        if q.offset.is_some() || q.fetch.is_some() {
            return Err(build_err("OFFSET/FETCH is not supported"));
        }
        let select = match q.body.as_ref() {
            SetExpr::Select(s) => s.as_ref(),
            _ => return Err(build_err("only simple SELECT is supported")),
        };
        if select.distinct.is_some() {
            return Err(build_err("DISTINCT is not supported"));
        }
        if select.into.is_some() {
            return Err(build_err("SELECT ... INTO is not supported"));
        }

        let (mut plan, scope) = self.build_from(&select.from)?;
        if !scope.tables.is_empty() {
            self.flags.column_pruning = true;
        }

        if let Some(selection) = &select.selection {
            let predicate = self.expr(selection, &scope, None)?;
            self.flags.constant_folding = true;
            self.flags.filter_merge = true;
            self.flags.predicate_pushdown = true;
            plan = LogicalPlan::Filter {
                id: self.ids.next_plan_id(),
                predicate,
                input: Box::new(plan),
            };
        }

        let group_exprs = match &select.group_by {
            GroupByExpr::Expressions(es, _) => es
                .iter()
                .map(|e| self.expr(e, &scope, None))
                .collect::<Result<Vec<_>>>()?,
            GroupByExpr::All(_) => return Err(build_err("GROUP BY ALL is not supported")),
        };

        let mut aggs: AggSink = vec![];
        let mut items: Vec<(Expr, String)> = vec![];
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(e) => {
                    let expr = self.expr(e, &scope, Some(&mut aggs))?;
                    let name = match &expr {
                        Expr::Column(c) if !aggs.iter().any(|(_, col)| &col.name == c) => {
                            strip_qual(c).to_string()
                        }
                        _ => e.to_string(),
                    };
                    items.push((expr, name));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let expr = self.expr(expr, &scope, Some(&mut aggs))?;
                    items.push((expr, alias.value.clone()));
                }
                SelectItem::Wildcard(_) => {
                    for t in &scope.tables {
                        for c in &t.def.columns {
                            items.push((Expr::Column(format!("{}.{}", t.qualifier, c.name)), c.name.clone()));
                        }
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let q = name.0.last().map(|i| i.value.as_str()).unwrap_or_default();
                    let t = scope
                        .tables
                        .iter()
                        .find(|t| t.qualifier.eq_ignore_ascii_case(q))
                        .ok_or_else(|| build_err(format!("unknown table '{name}' in select list")))?;
                    for c in &t.def.columns {
                        items.push((Expr::Column(format!("{}.{}", t.qualifier, c.name)), c.name.clone()));
                    }
                }
            }
        }
        if items.is_empty() {
            return Err(build_err("empty select list"));
        }

        let having = match &select.having {
            Some(h) => Some(self.expr(h, &scope, Some(&mut aggs))?),
            None => None,
        };

        if !aggs.is_empty() || !group_exprs.is_empty() {
            for (e, _) in &items {
                for col in expr_columns(e) {
                    let grouped = group_exprs.contains(&Expr::Column(col.clone()));
                    let aggregated = aggs.iter().any(|(_, c)| c.name == col);
                    if !grouped && !aggregated {
                        return Err(build_err(format!(
                            "column '{col}' must appear in GROUP BY or an aggregate"
                        )));
                    }
                }
            }
            plan = LogicalPlan::Aggregate {
                id: self.ids.next_plan_id(),
                group_exprs,
                aggr_exprs: aggs.clone(),
                input: Box::new(plan),
            };
            if let Some(h) = having {
                self.flags.constant_folding = true;
                plan = LogicalPlan::Filter {
                    id: self.ids.next_plan_id(),
                    predicate: h,
                    input: Box::new(plan),
                };
            }
        } else if having.is_some() {
            return Err(build_err("HAVING requires GROUP BY or an aggregate"));
        }

        if items.iter().any(|(e, _)| !matches!(e, Expr::Column(_))) {
            self.flags.constant_folding = true;
        }
        let mut exprs = Vec::with_capacity(items.len());
        for (e, name) in items {
            let dt = self.type_of(&e, &scope, &aggs);
            let col = self.column(name, dt);
            exprs.push((e, col));
        }
        plan = LogicalPlan::Projection {
            id: self.ids.next_plan_id(),
            exprs,
            input: Box::new(plan),
        };

        if let Some(limit) = &q.limit {
            let n = match limit {
                SqlExpr::Value(Value::Number(s, _)) => s
                    .parse::<usize>()
                    .map_err(|_| build_err(format!("LIMIT must be a non-negative integer: {s}")))?,
                other => return Err(build_err(format!("LIMIT must be a literal integer: {other}"))),
            };
            plan = LogicalPlan::Limit {
                id: self.ids.next_plan_id(),
                n,
                input: Box::new(plan),
            };
        }
        Ok(plan)
    }

    fn build_from(&mut self, from: &[TableWithJoins]) -> Result<(LogicalPlan, Scope<'a>)> {
        let twj = match from {
            [] => {
                let plan = LogicalPlan::Values {
                    id: self.ids.next_plan_id(),
                    columns: vec![],
                    rows: vec![vec![]],
                };
                return Ok((plan, Scope::default()));
            }
            [one] => one,
            _ => return Err(build_err("only one FROM source is supported")),
        };

        let mut scope = Scope::default();
        let mut plan = self.scan(&twj.relation, &mut scope, Privilege::Select)?;
        for join in &twj.joins {
            let left_quals = scope
                .tables
                .iter()
                .map(|t| t.qualifier.clone())
                .collect::<Vec<_>>();
            let right = self.scan(&join.relation, &mut scope, Privilege::Select)?;
            let constraint = match &join.join_operator {
                JoinOperator::Inner(c) => c,
                _ => return Err(build_err("only INNER JOIN is supported")),
            };
            let on = match constraint {
                JoinConstraint::On(e) => self.equi_join_pairs(e, &scope, &left_quals)?,
                _ => return Err(build_err("JOIN requires ON ...")),
            };
            self.flags.join_hinting = true;
            plan = LogicalPlan::Join {
                id: self.ids.next_plan_id(),
                left: Box::new(plan),
                right: Box::new(right),
                on,
                strategy_hint: self.hints.join_hint(self.block).unwrap_or(JoinStrategyHint::Auto),
            };
        }
        Ok((plan, scope))
    }

    fn scan(
        &mut self,
        factor: &TableFactor,
        scope: &mut Scope<'a>,
        privilege: Privilege,
    ) -> Result<LogicalPlan> {
        let (name, alias) = match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    return Err(build_err("table functions are not supported"));
                }
                (name, alias)
            }
            TableFactor::Derived { .. } => return Err(build_err("derived tables are not supported")),
            other => return Err(build_err(format!("unsupported FROM item: {other}"))),
        };
        let def = self.lookup_table(name)?;
        let qualifier = alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| def.name.clone());
        if scope
            .tables
            .iter()
            .any(|t| t.qualifier.eq_ignore_ascii_case(&qualifier))
        {
            return Err(build_err(format!("not unique table/alias: '{qualifier}'")));
        }
        self.visit_table(privilege, def);

        let columns = def
            .columns
            .iter()
            .map(|c| self.column(c.name.clone(), c.data_type.clone()))
            .collect();
        let hints = self.hints.table_hints(self.block, &qualifier);
        scope.tables.push(ScopeTable {
            qualifier: qualifier.clone(),
            def,
        });
        Ok(LogicalPlan::TableScan {
            id: self.ids.next_plan_id(),
            db: def.db.clone(),
            table: def.name.clone(),
            qualifier,
            columns,
            projection: None,
            filters: vec![],
            hints,
        })
    }

    fn equi_join_pairs(
        &mut self,
        e: &SqlExpr,
        scope: &Scope<'a>,
        left_quals: &[String],
    ) -> Result<Vec<(String, String)>> {
        let mut pairs = vec![];
        let mut stack = vec![e];
        while let Some(e) = stack.pop() {
            match e {
                SqlExpr::BinaryOp {
                    left,
                    op: SqlBinaryOp::And,
                    right,
                } => {
                    stack.push(right);
                    stack.push(left);
                }
                SqlExpr::Nested(inner) => stack.push(inner),
                SqlExpr::BinaryOp {
                    left,
                    op: SqlBinaryOp::Eq,
                    right,
                } => {
                    let (Expr::Column(l), Expr::Column(r)) =
                        (self.expr(left, scope, None)?, self.expr(right, scope, None)?)
                    else {
                        return Err(build_err("JOIN ... ON must compare columns"));
                    };
                    let is_left = |c: &str| {
                        c.rsplit_once('.')
                            .is_some_and(|(q, _)| left_quals.iter().any(|x| x == q))
                    };
                    match (is_left(&l), is_left(&r)) {
                        (true, false) => pairs.push((l, r)),
                        (false, true) => pairs.push((r, l)),
                        _ => return Err(build_err("JOIN ... ON must relate both sides")),
                    }
                }
                other => {
                    return Err(build_err(format!(
                        "JOIN ... ON must be a conjunction of equalities: {other}"
                    )))
                }
            }
        }
        Ok(pairs)
    }

    // -----------------------------
    // DML
    // -----------------------------

    fn build_insert(&mut self, insert: &Insert) -> Result<LogicalPlan> {
        let def = self.lookup_table(&insert.table_name)?;
        self.visit_table(Privilege::Insert, def);

        let columns = if insert.columns.is_empty() {
            def.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>()
        } else {
            insert
                .columns
                .iter()
                .map(|c| {
                    def.column(&c.value)
                        .map(|col| col.name.clone())
                        .ok_or_else(|| build_err(format!("unknown column '{}'", c.value)))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let source = insert
            .source
            .as_ref()
            .ok_or_else(|| build_err("INSERT requires VALUES or SELECT"))?;
        let input = match source.body.as_ref() {
            SetExpr::Values(values) => {
                let empty = Scope::default();
                let mut rows = Vec::with_capacity(values.rows.len());
                for (i, row) in values.rows.iter().enumerate() {
                    if row.len() != columns.len() {
                        return Err(build_err(format!(
                            "column count doesn't match value count at row {}",
                            i + 1
                        )));
                    }
                    rows.push(
                        row.iter()
                            .map(|e| self.expr(e, &empty, None))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                let cols = columns
                    .iter()
                    .map(|name| {
                        let dt = def
                            .column(name)
                            .map(|c| c.data_type.clone())
                            .unwrap_or(DataType::Null);
                        self.column(name.clone(), dt)
                    })
                    .collect();
                self.flags.constant_folding = true;
                LogicalPlan::Values {
                    id: self.ids.next_plan_id(),
                    columns: cols,
                    rows,
                }
            }
            _ => {
                let plan = self.build_query(source)?;
                let width = plan.output_names().len();
                if width != columns.len() {
                    return Err(build_err(format!(
                        "column count doesn't match: {} target columns, {width} selected",
                        columns.len()
                    )));
                }
                plan
            }
        };

        let on_duplicate = match &insert.on {
            None => vec![],
            Some(OnInsert::DuplicateKeyUpdate(assignments)) => {
                self.visit_table(Privilege::Update, def);
                let scope = Scope {
                    tables: vec![ScopeTable {
                        qualifier: def.name.clone(),
                        def,
                    }],
                };
                self.assignments(assignments, &scope, def)?
            }
            Some(_) => return Err(build_err("only ON DUPLICATE KEY UPDATE is supported")),
        };

        Ok(LogicalPlan::Insert {
            id: self.ids.next_plan_id(),
            db: def.db.clone(),
            table: def.name.clone(),
            columns,
            on_duplicate,
            input: Box::new(input),
        })
    }

    fn build_update(
        &mut self,
        table: &TableWithJoins,
        assignments: &[Assignment],
        selection: Option<&SqlExpr>,
    ) -> Result<LogicalPlan> {
        if !table.joins.is_empty() {
            return Err(build_err("multi-table UPDATE is not supported"));
        }
        let mut scope = Scope::default();
        let mut input = self.scan(&table.relation, &mut scope, Privilege::Update)?;
        let def = scope.tables[0].def;
        let assignments = self.assignments(assignments, &scope, def)?;
        for (col, _) in &assignments {
            let record = VisitRecord::table(Privilege::Update, &def.db, &def.name).with_column(col);
            self.visits.push(record);
        }
        self.flags.constant_folding = true;
        if let Some(selection) = selection {
            input = self.dml_filter(selection, &scope, def, input)?;
        }
        Ok(LogicalPlan::Update {
            id: self.ids.next_plan_id(),
            db: def.db.clone(),
            table: def.name.clone(),
            assignments,
            input: Box::new(input),
        })
    }

    fn build_delete(&mut self, delete: &Delete) -> Result<LogicalPlan> {
        if !delete.tables.is_empty() || delete.using.is_some() {
            return Err(build_err("multi-table DELETE is not supported"));
        }
        if !delete.order_by.is_empty() || delete.limit.is_some() || delete.returning.is_some() {
            return Err(build_err("DELETE ... ORDER BY/LIMIT/RETURNING is not supported"));
        }
        let from = match &delete.from {
            FromTable::WithFromKeyword(v) | FromTable::WithoutKeyword(v) => v,
        };
        let twj = match from.as_slice() {
            [one] if one.joins.is_empty() => one,
            _ => return Err(build_err("DELETE must target exactly one table")),
        };
        let mut scope = Scope::default();
        let mut input = self.scan(&twj.relation, &mut scope, Privilege::Delete)?;
        let def = scope.tables[0].def;
        if let Some(selection) = &delete.selection {
            input = self.dml_filter(selection, &scope, def, input)?;
        }
        Ok(LogicalPlan::Delete {
            id: self.ids.next_plan_id(),
            db: def.db.clone(),
            table: def.name.clone(),
            input: Box::new(input),
        })
    }

    fn dml_filter(
        &mut self,
        selection: &SqlExpr,
        scope: &Scope<'a>,
        def: &TableDef,
        input: LogicalPlan,
    ) -> Result<LogicalPlan> {
        let predicate = self.expr(selection, scope, None)?;
        self.visit_table(Privilege::Select, def);
        self.flags.predicate_pushdown = true;
        self.flags.filter_merge = true;
        Ok(LogicalPlan::Filter {
            id: self.ids.next_plan_id(),
            predicate,
            input: Box::new(input),
        })
    }

    fn assignments(
        &mut self,
        assignments: &[Assignment],
        scope: &Scope<'a>,
        def: &TableDef,
    ) -> Result<Vec<(String, Expr)>> {
        assignments
            .iter()
            .map(|a| {
                let target = match &a.target {
                    AssignmentTarget::ColumnName(name) => name
                        .0
                        .last()
                        .map(|i| i.value.clone())
                        .ok_or_else(|| build_err("empty assignment target"))?,
                    AssignmentTarget::Tuple(_) => {
                        return Err(build_err("tuple assignment is not supported"))
                    }
                };
                let col = def
                    .column(&target)
                    .ok_or_else(|| build_err(format!("unknown column '{target}'")))?;
                Ok((col.name.clone(), self.expr(&a.value, scope, None)?))
            })
            .collect()
    }

    // -----------------------------
    // Expressions
    // -----------------------------

    fn expr(&mut self, e: &SqlExpr, scope: &Scope<'a>, mut aggs: Option<&mut AggSink>) -> Result<Expr> {
        Ok(match e {
            SqlExpr::Identifier(id) => Expr::Column(scope.resolve(std::slice::from_ref(id))?.0),
            SqlExpr::CompoundIdentifier(parts) => Expr::Column(scope.resolve(parts)?.0),
            SqlExpr::Value(v) => value_to_expr(v)?,
            SqlExpr::Nested(inner) => self.expr(inner, scope, aggs)?,
            SqlExpr::BinaryOp { left, op, right } => {
                let l = self.expr(left, scope, aggs.as_deref_mut())?;
                let r = self.expr(right, scope, aggs.as_deref_mut())?;
                match op {
                    SqlBinaryOp::And => Expr::And(Box::new(l), Box::new(r)),
                    SqlBinaryOp::Or => Expr::Or(Box::new(l), Box::new(r)),
                    other => Expr::BinaryOp {
                        left: Box::new(l),
                        op: binop(other)?,
                        right: Box::new(r),
                    },
                }
            }
            SqlExpr::UnaryOp { op, expr } => match (op, self.expr(expr, scope, aggs)?) {
                (UnaryOperator::Not, x) => Expr::Not(Box::new(x)),
                (UnaryOperator::Minus, Expr::Literal(LiteralValue::Int64(v))) => {
                    Expr::Literal(LiteralValue::Int64(-v))
                }
                (UnaryOperator::Minus, Expr::Literal(LiteralValue::Float64(v))) => {
                    Expr::Literal(LiteralValue::Float64(-v))
                }
                (UnaryOperator::Plus, x) => x,
                (op, _) => return Err(build_err(format!("unsupported unary operator: {op}"))),
            },
            SqlExpr::IsNull(x) => Expr::IsNull(Box::new(self.expr(x, scope, aggs)?)),
            SqlExpr::IsNotNull(x) => Expr::IsNotNull(Box::new(self.expr(x, scope, aggs)?)),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(self.expr(expr, scope, aggs.as_deref_mut())?),
                list: list
                    .iter()
                    .map(|x| self.expr(x, scope, aggs.as_deref_mut()))
                    .collect::<Result<Vec<_>>>()?,
                negated: *negated,
            },
            SqlExpr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let x = self.expr(expr, scope, aggs.as_deref_mut())?;
                let lo = self.expr(low, scope, aggs.as_deref_mut())?;
                let hi = self.expr(high, scope, aggs.as_deref_mut())?;
                let between = Expr::And(
                    Box::new(Expr::BinaryOp {
                        left: Box::new(x.clone()),
                        op: BinaryOp::GtEq,
                        right: Box::new(lo),
                    }),
                    Box::new(Expr::BinaryOp {
                        left: Box::new(x),
                        op: BinaryOp::LtEq,
                        right: Box::new(hi),
                    }),
                );
                if *negated {
                    Expr::Not(Box::new(between))
                } else {
                    between
                }
            }
            SqlExpr::Function(func) => {
                let Some(sink) = aggs else {
                    return Err(build_err(format!("function not allowed here: {e}")));
                };
                let fname = func
                    .name
                    .0
                    .last()
                    .map(|i| i.value.to_ascii_uppercase())
                    .unwrap_or_default();
                let arg = match &func.args {
                    FunctionArguments::List(list) if list.args.len() == 1 => &list.args[0],
                    _ => return Err(build_err(format!("{fname} requires one argument"))),
                };
                let arg_expr = match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Wildcard) if fname == "COUNT" => {
                        Expr::lit_i64(1)
                    }
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(x)) => self.expr(x, scope, None)?,
                    _ => return Err(build_err(format!("unsupported argument to {fname}"))),
                };
                let agg = match fname.as_str() {
                    "COUNT" => AggExpr::Count(arg_expr),
                    "SUM" => AggExpr::Sum(arg_expr),
                    "MIN" => AggExpr::Min(arg_expr),
                    "MAX" => AggExpr::Max(arg_expr),
                    "AVG" => AggExpr::Avg(arg_expr),
                    _ => return Err(build_err(format!("unsupported function: {fname}"))),
                };
                let name = agg.to_string();
                if !sink.iter().any(|(a, _)| a == &agg) {
                    let dt = agg_type(&agg, scope);
                    let col = self.column(name.clone(), dt);
                    sink.push((agg, col));
                }
                Expr::Column(name)
            }
            SqlExpr::Subquery(_) | SqlExpr::InSubquery { .. } | SqlExpr::Exists { .. } => {
                return Err(build_err("subqueries are not supported"))
            }
            other => return Err(build_err(format!("unsupported expression: {other}"))),
        })
    }

    fn type_of(&self, e: &Expr, scope: &Scope<'a>, aggs: &AggSink) -> DataType {
        match e {
            Expr::Column(c) => aggs
                .iter()
                .find(|(_, col)| &col.name == c)
                .map(|(_, col)| col.data_type.clone())
                .or_else(|| scope.type_of(c))
                .unwrap_or(DataType::Null),
            Expr::Literal(v) => literal_type(v),
            Expr::Placeholder(_) => DataType::Null,
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => {
                    let (l, r) = (self.type_of(left, scope, aggs), self.type_of(right, scope, aggs));
                    if l == DataType::Float64 || r == DataType::Float64 || *op == BinaryOp::Divide {
                        DataType::Float64
                    } else {
                        l
                    }
                }
                _ => DataType::Boolean,
            },
            Expr::And(..)
            | Expr::Or(..)
            | Expr::Not(_)
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::InList { .. } => DataType::Boolean,
        }
    }
}

fn agg_type(agg: &AggExpr, scope: &Scope<'_>) -> DataType {
    let arg_type = match agg.arg() {
        Expr::Column(c) => scope.type_of(c).unwrap_or(DataType::Null),
        Expr::Literal(v) => literal_type(v),
        _ => DataType::Null,
    };
    match agg {
        AggExpr::Count(_) => DataType::Int64,
        AggExpr::Avg(_) => DataType::Float64,
        AggExpr::Sum(_) if matches!(arg_type, DataType::Float32 | DataType::Float64) => {
            DataType::Float64
        }
        AggExpr::Sum(_) => DataType::Int64,
        AggExpr::Min(_) | AggExpr::Max(_) => arg_type,
    }
}

fn literal_type(v: &LiteralValue) -> DataType {
    match v {
        LiteralValue::Int64(_) => DataType::Int64,
        LiteralValue::Float64(_) => DataType::Float64,
        LiteralValue::Utf8(_) => DataType::Utf8,
        LiteralValue::Boolean(_) => DataType::Boolean,
        LiteralValue::Null => DataType::Null,
    }
}

/// Convert a SQL literal or parameter marker.
pub fn value_to_expr(v: &Value) -> Result<Expr> {
    Ok(match v {
        Value::Number(s, _) => {
            if s.contains('.') || s.contains('e') || s.contains('E') {
                let f: f64 = s.parse().map_err(|_| build_err(format!("bad number: {s}")))?;
                Expr::Literal(LiteralValue::Float64(f))
            } else {
                let i: i64 = s.parse().map_err(|_| build_err(format!("bad number: {s}")))?;
                Expr::Literal(LiteralValue::Int64(i))
            }
        }
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
            Expr::Literal(LiteralValue::Utf8(s.clone()))
        }
        Value::Boolean(b) => Expr::Literal(LiteralValue::Boolean(*b)),
        Value::Null => Expr::Literal(LiteralValue::Null),
        Value::Placeholder(p) => Expr::Placeholder(p.clone()),
        other => return Err(build_err(format!("unsupported literal: {other}"))),
    })
}

fn binop(op: &SqlBinaryOp) -> Result<BinaryOp> {
    Ok(match op {
        SqlBinaryOp::Eq => BinaryOp::Eq,
        SqlBinaryOp::NotEq => BinaryOp::NotEq,
        SqlBinaryOp::Lt => BinaryOp::Lt,
        SqlBinaryOp::LtEq => BinaryOp::LtEq,
        SqlBinaryOp::Gt => BinaryOp::Gt,
        SqlBinaryOp::GtEq => BinaryOp::GtEq,
        SqlBinaryOp::Plus => BinaryOp::Plus,
        SqlBinaryOp::Minus => BinaryOp::Minus,
        SqlBinaryOp::Multiply => BinaryOp::Multiply,
        SqlBinaryOp::Divide => BinaryOp::Divide,
        other => return Err(build_err(format!("unsupported binary operator: {other}"))),
    })
}

/// First words of a statement, for error messages.
fn statement_head(stmt: &Statement) -> String {
    let text = stmt.to_string();
    let head = text.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    debug!(operator = "PlanBuilder", statement = %text, "statement kind not supported");
    head
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;
    use keel_common::ErrorKind;
    use keel_storage::{Catalog, SchemaSnapshot, TableDef};

    use super::PlanBuilder;
    use crate::logical_plan::{JoinStrategyHint, LogicalPlan};
    use crate::plan::{IdAllocator, NonLogicalKind, Plan};
    use crate::privilege::Privilege;

    fn snapshot() -> SchemaSnapshot {
        let mut cat = Catalog::new();
        cat.register_table(
            TableDef::new(1, "main", "t")
                .with_column("id", DataType::Int64)
                .with_column("a", DataType::Int64)
                .with_column("b", DataType::Utf8)
                .with_primary_key(&["id"]),
        )
        .unwrap();
        cat.register_table(
            TableDef::new(2, "main", "s")
                .with_column("id", DataType::Int64)
                .with_column("c", DataType::Float64)
                .with_primary_key(&["id"]),
        )
        .unwrap();
        cat.snapshot()
    }

    fn build(sql: &str) -> keel_common::Result<(Plan, PlanBuilderOutput)> {
        let snap = snapshot();
        let mut ids = IdAllocator::new();
        let node = keel_sql::parse_one(sql).unwrap();
        let mut b = PlanBuilder::new(&snap, "main", &mut ids);
        let plan = b.build(&node)?;
        let out = PlanBuilderOutput {
            records: b
                .visit_records()
                .iter()
                .map(|r| (r.privilege, r.table.clone()))
                .collect(),
            tables: b.referenced_tables().iter().map(|t| t.to_string()).collect(),
            join_hinting: b.opt_flags().join_hinting,
        };
        Ok((plan, out))
    }

    #[derive(Debug)]
    struct PlanBuilderOutput {
        records: Vec<(Privilege, String)>,
        tables: Vec<String>,
        join_hinting: bool,
    }

    #[test]
    fn builds_join_with_qualified_keys_and_records() {
        let (plan, out) = build("SELECT t.a, c FROM t JOIN s ON t.id = s.id WHERE t.a > 1").unwrap();
        let Plan::Logical(LogicalPlan::Projection { input, exprs, .. }) = plan else {
            panic!("expected projection");
        };
        assert_eq!(exprs[1].1.name, "c");
        assert_eq!(exprs[1].1.data_type, DataType::Float64);
        let LogicalPlan::Filter { input, .. } = *input else {
            panic!("expected filter");
        };
        let LogicalPlan::Join { on, strategy_hint, .. } = *input else {
            panic!("expected join");
        };
        assert_eq!(on, vec![("t.id".to_string(), "s.id".to_string())]);
        assert_eq!(strategy_hint, JoinStrategyHint::Auto);
        assert_eq!(out.tables, vec!["main.t".to_string(), "main.s".to_string()]);
        assert_eq!(
            out.records,
            vec![(Privilege::Select, "t".to_string()), (Privilege::Select, "s".to_string())]
        );
        assert!(out.join_hinting);
    }

    #[test]
    fn join_hint_from_block_is_applied() {
        let (plan, _) = build("SELECT t.a FROM t WITH (shuffle_join) JOIN s ON s.id = t.id").unwrap();
        let Plan::Logical(LogicalPlan::Projection { input, .. }) = plan else {
            panic!("expected projection");
        };
        assert!(matches!(
            *input,
            LogicalPlan::Join {
                strategy_hint: JoinStrategyHint::Shuffle,
                ..
            }
        ));
    }

    #[test]
    fn aggregate_with_having_collects_hidden_aggregates() {
        let (plan, _) = build("SELECT a, COUNT(*) AS n FROM t GROUP BY a HAVING SUM(a) > 3").unwrap();
        let Plan::Logical(LogicalPlan::Projection { input, .. }) = plan else {
            panic!("expected projection");
        };
        let LogicalPlan::Filter { input, .. } = *input else {
            panic!("expected having filter");
        };
        let LogicalPlan::Aggregate { aggr_exprs, .. } = *input else {
            panic!("expected aggregate");
        };
        assert_eq!(aggr_exprs.len(), 2);
    }

    #[test]
    fn ungrouped_column_is_rejected() {
        let err = build("SELECT b, COUNT(a) FROM t GROUP BY a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlanBuild);
    }

    #[test]
    fn insert_arity_mismatch_is_a_build_error() {
        let err = build("INSERT INTO t (id, a) VALUES (1, 2, 3)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlanBuild);
        let (_, out) = build("INSERT INTO t (id, a) VALUES (1, 2)").unwrap();
        assert_eq!(out.records, vec![(Privilege::Insert, "t".to_string())]);
    }

    #[test]
    fn update_records_write_then_read() {
        let (plan, out) = build("UPDATE t SET a = a + 1 WHERE id = 5").unwrap();
        assert!(matches!(plan, Plan::Logical(LogicalPlan::Update { .. })));
        assert_eq!(
            out.records,
            vec![
                (Privilege::Update, "t".to_string()),
                (Privilege::Update, "t".to_string()),
                (Privilege::Select, "t".to_string()),
            ]
        );
    }

    #[test]
    fn unknown_objects_fail() {
        assert!(build("SELECT x FROM t").is_err());
        assert!(build("SELECT a FROM nope").is_err());
        assert!(build("SELECT id FROM t JOIN s ON t.id = s.id").is_err());
    }

    #[test]
    fn session_statements_are_non_logical() {
        for (sql, kind) in [
            ("BEGIN", NonLogicalKind::Begin),
            ("COMMIT", NonLogicalKind::Commit),
            ("SHOW TABLES", NonLogicalKind::Show),
            ("SET autocommit = 0", NonLogicalKind::Set),
            ("EXPLAIN SELECT a FROM t", NonLogicalKind::Explain),
        ] {
            match build(sql).unwrap().0 {
                Plan::NonLogical(p) => assert_eq!(p.kind, kind, "{sql}"),
                other => panic!("{sql}: unexpected plan {other:?}"),
            }
        }
    }

    #[test]
    fn explain_records_visits_of_the_explained_statement() {
        let (plan, out) = build("EXPLAIN SELECT a FROM t WHERE id = 1").unwrap();
        assert!(matches!(plan, Plan::NonLogical(_)));
        assert_eq!(out.records, vec![(Privilege::Select, "t".to_string())]);
        assert_eq!(out.tables, vec!["main.t".to_string()]);
        assert!(build("EXPLAIN SELECT x FROM nope").is_err());
    }

    #[test]
    fn ids_are_unique_within_a_build() {
        let snap = snapshot();
        let mut ids = IdAllocator::new();
        let node = keel_sql::parse_one("SELECT a FROM t WHERE id = 1 LIMIT 3").unwrap();
        let plan = PlanBuilder::new(&snap, "main", &mut ids).build(&node).unwrap();
        let Plan::Logical(limit) = plan else {
            panic!("expected logical plan");
        };
        let mut seen = vec![];
        let mut stack = vec![&limit];
        while let Some(p) = stack.pop() {
            assert!(!seen.contains(&p.id()));
            seen.push(p.id());
            stack.extend(p.children());
        }
        assert_eq!(seen.len() as u32, ids.plan_ids_allocated());
    }
}
