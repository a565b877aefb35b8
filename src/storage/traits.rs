//! Abstract storage traits for ChatReflex.
//!
//! These traits define the read/write contract the runtime needs from the
//! persistent store and the telemetry sink. Schema and query mechanics belong
//! to the implementation.

use thiserror::Error;

use crate::schedule::{ScheduleId, ScheduleRecord};
use crate::telemetry::TelemetryEvent;
use crate::trigger::{TriggerId, TriggerRow};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Trigger not found.
    #[error("Trigger not found: {0}")]
    TriggerNotFound(TriggerId),

    /// Schedule not found.
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(ScheduleId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Storage trait for triggers.
///
/// Implementations must be safe for concurrent use: the cache refresh, the
/// cooldown persistence worker and the admin surface all call in parallel.
pub trait TriggerStore: Send + Sync {
    /// All triggers, in a stable order (insertion order).
    fn list_triggers(&self) -> Result<Vec<TriggerRow>, StorageError>;

    /// Insert a new trigger row. Returns its id.
    fn insert_trigger(&self, row: TriggerRow) -> Result<TriggerId, StorageError>;

    /// Delete a trigger. Returns whether a row was removed.
    fn delete_trigger(&self, id: TriggerId) -> Result<bool, StorageError>;

    /// Persist the last fire time of a trigger. A missing row is not an error.
    fn update_last_fired(&self, id: TriggerId, timestamp: f64) -> Result<(), StorageError>;
}

/// Storage trait for scheduled broadcasts.
pub trait ScheduleStore: Send + Sync {
    /// All schedules, in insertion order.
    fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, StorageError>;

    /// Insert a new schedule. Returns its id.
    fn insert_schedule(&self, record: ScheduleRecord) -> Result<ScheduleId, StorageError>;

    /// Delete a schedule. Returns whether a row was removed.
    fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StorageError>;

    /// Current `enabled` flag, or `None` when the row no longer exists.
    fn read_schedule_enabled(&self, id: ScheduleId) -> Result<Option<bool>, StorageError>;

    /// Flip the `enabled` flag. Returns whether the row exists.
    fn set_schedule_enabled(&self, id: ScheduleId, enabled: bool) -> Result<bool, StorageError>;
}

/// Batched telemetry sink.
pub trait TelemetrySink: Send + Sync {
    /// Write all rows in one call.
    fn insert_batch(&self, rows: &[TelemetryEvent]) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_trigger_store_object_safe(_: &dyn TriggerStore) {}
    fn _assert_schedule_store_object_safe(_: &dyn ScheduleStore) {}
    fn _assert_telemetry_sink_object_safe(_: &dyn TelemetrySink) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::TriggerNotFound(TriggerId::new());
        assert!(err.to_string().contains("Trigger not found"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}
