//! Shared storage helper functions.
//!
//! Timestamp and uint256 conversions used by the SQLite stores.

use chrono::{DateTime, SecondsFormat, Utc};
use ethers_core::types::U256;

use super::{Result, StorageError};

/// Format a timestamp the way every TEXT timestamp column stores it.
///
/// Fixed width (microseconds, `Z` suffix) so that comparing the strings
/// compares the instants.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored TEXT timestamp.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{raw}: {e}")))
}

/// Parse a base-10 TEXT column holding a uint256.
pub fn parse_u256(column: &str, raw: &str) -> Result<U256> {
    U256::from_dec_str(raw).map_err(|e| StorageError::InvalidAmount {
        column: column.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
