//! Hybrid logical timestamps.
//!
//! A timestamp packs wall-clock milliseconds in the high bits and an 18-bit
//! logical counter in the low bits, so timestamps order like the instants
//! they were allocated at.

use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

const LOGICAL_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Text layout of persisted GC times, e.g. `20240102-15:04:05 +0800`.
pub const GC_TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S %z";

/// Hybrid logical timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(
    /// Raw packed value.
    pub u64,
);

impl Timestamp {
    /// Smallest timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Pack physical milliseconds and a logical counter.
    pub fn compose(physical_ms: u64, logical: u64) -> Self {
        Timestamp((physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// Wall-clock milliseconds since the unix epoch.
    pub fn physical_ms(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Logical counter.
    pub fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Timestamp of a wall-clock instant with logical part zero.
    pub fn from_datetime<Tz: chrono::TimeZone>(t: &DateTime<Tz>) -> Self {
        let ms = t.timestamp_millis().max(0) as u64;
        Timestamp::compose(ms, 0)
    }

    /// Wall-clock instant of the physical part.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let ms = i64::try_from(self.physical_ms()).ok()?;
        DateTime::<Utc>::from_timestamp_millis(ms)
    }

    /// Render the physical part in [`GC_TIME_FORMAT`].
    pub fn to_gc_time_string(self) -> String {
        match self.to_datetime() {
            Some(t) => t.format(GC_TIME_FORMAT).to_string(),
            None => format!("ts({})", self.0),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a persisted GC time.
///
/// Values written by older releases carry a trailing zone abbreviation
/// (`20240102-15:04:05 +0800 CST`); when the strict layout fails, the last
/// space-separated field is dropped and parsing is retried.
pub fn parse_gc_time(value: &str) -> Result<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(t) = DateTime::parse_from_str(value, GC_TIME_FORMAT) {
        return Ok(t);
    }
    let prefix = match value.rsplit_once(' ') {
        Some((prefix, _)) => prefix,
        None => value,
    };
    DateTime::parse_from_str(prefix, GC_TIME_FORMAT)
        .map_err(|e| KeelError::InvalidConfig(format!("malformed GC time '{value}': {e}")))
}
