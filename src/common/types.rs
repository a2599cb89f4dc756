use std::cmp::Ordering;
use std::fmt::Display;

use chrono::DateTime;
use get_size::GetSize;
use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
pub type Timestamp = i64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Sample { timestamp, value }
    }
}

impl Eq for Sample {}

impl PartialOrd for Sample {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sample {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.value.total_cmp(&other.value))
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}", self.value, fmt_timestamp(self.timestamp))
    }
}

/// Inclusive [start, end] window in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> crate::error::VaultResult<Self> {
        if start > end {
            return Err(crate::error::VaultError::InvalidTimeRange(start, end));
        }
        Ok(TimeRange { start, end })
    }

    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= end && self.end >= start
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}]",
            fmt_timestamp(self.start),
            fmt_timestamp(self.end)
        )
    }
}

/// Renders a millisecond timestamp as rfc3339 for messages and logs. Falls
/// back to the raw number when the value is outside chrono's range.
pub fn fmt_timestamp(ts: Timestamp) -> String {
    match DateTime::from_timestamp_millis(ts) {
        Some(dt) => dt.to_rfc3339(),
        None => ts.to_string(),
    }
}
