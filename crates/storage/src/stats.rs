use serde::{Deserialize, Serialize};

/// Row count assumed for tables that were never analyzed.
pub const PSEUDO_ROW_COUNT: u64 = 10_000;
/// Average row width assumed when byte statistics are missing.
pub const PSEUDO_ROW_BYTES: u64 = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: Option<u64>,
    pub bytes: Option<u64>,
}

impl TableStats {
    pub fn row_count(&self) -> u64 {
        self.rows.unwrap_or(PSEUDO_ROW_COUNT)
    }

    pub fn avg_row_bytes(&self) -> u64 {
        match (self.rows, self.bytes) {
            (Some(rows), Some(bytes)) if rows > 0 => (bytes / rows).max(1),
            _ => PSEUDO_ROW_BYTES,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes
            .unwrap_or_else(|| self.row_count() * self.avg_row_bytes())
    }
}
