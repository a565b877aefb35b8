//! Scheduled broadcast records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(Uuid);

impl ScheduleId {
    /// Create a new random schedule id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ScheduleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A persisted periodic broadcast.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub message: String,
    pub interval_minutes: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// Lifecycle state of a schedule inside a running scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Loaded, no timer running.
    Pending,
    /// Wait-then-fire loop active.
    Running,
    /// Timer cancelled or schedule removed.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_defaults_enabled_when_absent() {
        let id = ScheduleId::new();
        let json = format!(r#"{{"id":"{id}","message":"hi","interval_minutes":5}}"#);
        let rec: ScheduleRecord = serde_json::from_str(&json).unwrap();
        assert!(rec.enabled);
        assert_eq!(rec.interval_minutes, 5);
    }
}
