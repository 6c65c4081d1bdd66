//! Per-query-block table hints.
//!
//! Hints are written as table hints, `FROM t WITH (use_index(idx_a), broadcast_join)`,
//! and scoped to the query block they appear in. Blocks are numbered from 1
//! in pre-order: the statement itself when it is not a query, then every
//! query and subquery as it is entered.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use keel_common::StorageEngine;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr as SqlExpr, FunctionArg, FunctionArgExpr, FunctionArguments, Query, Statement,
    TableFactor, Visit, Visitor,
};
use tracing::warn;

use crate::logical_plan::JoinStrategyHint;

/// Hints attached to one table reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHints {
    /// Only these indexes may be used; empty means no restriction.
    pub use_index: Vec<String>,
    pub ignore_index: Vec<String>,
    /// Engine the table must be read from.
    pub read_from_storage: Option<StorageEngine>,
}

impl TableHints {
    pub fn is_empty(&self) -> bool {
        self.use_index.is_empty() && self.ignore_index.is_empty() && self.read_from_storage.is_none()
    }

    /// Whether `index` may be considered under these hints.
    pub fn allows_index(&self, index: &str) -> bool {
        let listed = |names: &[String]| names.iter().any(|n| n.eq_ignore_ascii_case(index));
        !listed(&self.ignore_index) && (self.use_index.is_empty() || listed(&self.use_index))
    }
}

/// Hints of one query block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHints {
    /// Keyed by lowercase alias, or table name when unaliased.
    pub tables: BTreeMap<String, TableHints>,
    pub join: Option<JoinStrategyHint>,
}

/// Hints of a whole statement, indexed by block number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintTable {
    blocks: BTreeMap<usize, BlockHints>,
}

impl HintTable {
    pub fn table_hints(&self, block: usize, name: &str) -> TableHints {
        self.blocks
            .get(&block)
            .and_then(|b| b.tables.get(&name.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn join_hint(&self, block: usize) -> Option<JoinStrategyHint> {
        self.blocks.get(&block).and_then(|b| b.join)
    }

    pub fn block(&self, block: usize) -> Option<&BlockHints> {
        self.blocks.get(&block)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Walks a statement once and collects [`HintTable`].
#[derive(Debug, Default)]
pub struct BlockHintProcessor {
    hints: HintTable,
    stack: Vec<usize>,
    next_block: usize,
}

impl BlockHintProcessor {
    pub fn process(stmt: &Statement) -> HintTable {
        let mut p = BlockHintProcessor::default();
        let _ = stmt.visit(&mut p);
        p.hints
    }

    fn enter_block(&mut self) {
        self.next_block += 1;
        self.stack.push(self.next_block);
    }

    fn current_block(&self) -> usize {
        self.stack.last().copied().unwrap_or(1)
    }

    fn record(&mut self, table_key: String, hint: &SqlExpr) {
        let block = self.current_block();
        let entry = self.hints.blocks.entry(block).or_default();
        let Some((name, args)) = hint_parts(hint) else {
            warn!(operator = "BlockHintProcessor", hint = %hint, "unrecognized hint ignored");
            return;
        };
        match name.as_str() {
            "use_index" => entry.tables.entry(table_key).or_default().use_index.extend(args),
            "ignore_index" => entry
                .tables
                .entry(table_key)
                .or_default()
                .ignore_index
                .extend(args),
            "read_from_storage" => match args.first().map(|a| a.parse::<StorageEngine>()) {
                Some(Ok(engine)) if args.len() == 1 => {
                    entry.tables.entry(table_key).or_default().read_from_storage = Some(engine);
                }
                _ => warn!(
                    operator = "BlockHintProcessor",
                    hint = %hint,
                    "read_from_storage expects one engine name, hint ignored"
                ),
            },
            "broadcast_join" if args.is_empty() => entry.join = Some(JoinStrategyHint::BroadcastRight),
            "shuffle_join" if args.is_empty() => entry.join = Some(JoinStrategyHint::Shuffle),
            _ => warn!(operator = "BlockHintProcessor", hint = %hint, "unknown hint ignored"),
        }
    }
}

impl Visitor for BlockHintProcessor {
    type Break = ();

    fn pre_visit_statement(&mut self, stmt: &Statement) -> ControlFlow<Self::Break> {
        if !matches!(stmt, Statement::Query(_)) {
            self.enter_block();
        }
        ControlFlow::Continue(())
    }

    fn post_visit_statement(&mut self, stmt: &Statement) -> ControlFlow<Self::Break> {
        if !matches!(stmt, Statement::Query(_)) {
            self.stack.pop();
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.enter_block();
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.stack.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Table {
            name,
            alias,
            with_hints,
            ..
        } = factor
        {
            let key = match alias {
                Some(a) => a.name.value.to_ascii_lowercase(),
                None => name
                    .0
                    .last()
                    .map(|i| i.value.to_ascii_lowercase())
                    .unwrap_or_default(),
            };
            for hint in with_hints {
                self.record(key.clone(), hint);
            }
        }
        ControlFlow::Continue(())
    }
}

/// `name` or `name(arg, ...)` with identifier arguments.
fn hint_parts(hint: &SqlExpr) -> Option<(String, Vec<String>)> {
    match hint {
        SqlExpr::Identifier(id) => Some((id.value.to_ascii_lowercase(), vec![])),
        SqlExpr::Function(func) => {
            let name = func.name.0.last()?.value.to_ascii_lowercase();
            let args = match &func.args {
                FunctionArguments::None => vec![],
                FunctionArguments::List(list) => list
                    .args
                    .iter()
                    .map(|a| match a {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(SqlExpr::Identifier(id))) => {
                            Some(id.value.clone())
                        }
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()?,
                FunctionArguments::Subquery(_) => return None,
            };
            Some((name, args))
        }
        _ => None,
    }
}
