use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// Storage engines a plan may read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEngine {
    /// Primary row-oriented transactional store.
    Transactional,
    /// Columnar analytic replica. Differs in locking/consistency semantics
    /// for point lookups and must not serve write-adjacent statements.
    AnalyticReplica,
}

impl StorageEngine {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageEngine::Transactional => "transactional",
            StorageEngine::AnalyticReplica => "analytic_replica",
        }
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageEngine {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transactional" | "row" | "tikv" => Ok(StorageEngine::Transactional),
            "analytic_replica" | "analytic" | "columnar" | "tiflash" => {
                Ok(StorageEngine::AnalyticReplica)
            }
            other => Err(KeelError::InvalidConfig(format!(
                "unknown storage engine: {other}"
            ))),
        }
    }
}

/// Optimization backend used for logical plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerBackend {
    /// Fixed rewrite-rule sequence followed by cost-based physical selection.
    #[default]
    RulePipeline,
    /// Memo-based search over equivalent plans guided by the cost model.
    Cascades,
}

/// Planner/session configuration.
///
/// Seeds fresh session state; sessions may override per-connection values
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Backend used for logical plans.
    pub optimizer_backend: OptimizerBackend,
    /// Engines eligible for reads in a fresh session.
    pub isolation_read_engines: BTreeSet<StorageEngine>,
    /// Autocommit mode of a fresh session.
    pub autocommit: bool,
    /// Max table byte size eligible for broadcast joins.
    pub broadcast_threshold_bytes: u64,
    /// Number of hash partitions used by shuffle exchanges.
    pub shuffle_partitions: usize,
    /// Target row count for coalescing output batches.
    pub target_batch_rows: usize,
    /// Cache physical plans of prepared statements.
    pub enable_prepared_plan_cache: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            optimizer_backend: OptimizerBackend::RulePipeline,
            isolation_read_engines: BTreeSet::from([
                StorageEngine::Transactional,
                StorageEngine::AnalyticReplica,
            ]),
            autocommit: true,
            broadcast_threshold_bytes: 64 * 1024 * 1024,
            shuffle_partitions: 64,
            target_batch_rows: 8192,
            enable_prepared_plan_cache: true,
        }
    }
}

impl PlannerConfig {
    /// Parse a JSON configuration document; missing fields take defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: PlannerConfig =
            serde_json::from_str(s).map_err(|e| KeelError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.shuffle_partitions == 0 {
            return Err(KeelError::InvalidConfig(
                "shuffle_partitions must be positive".to_string(),
            ));
        }
        if self.target_batch_rows == 0 {
            return Err(KeelError::InvalidConfig(
                "target_batch_rows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
