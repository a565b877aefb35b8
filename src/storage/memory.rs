//! In-memory storage backend.
//!
//! Thread-safe implementations of the storage traits, intended for embedded
//! usage, tests, and as a reference implementation. Each store can be told to
//! fail its next calls, which lets callers exercise the swallow-and-continue
//! paths of the runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::schedule::{ScheduleId, ScheduleRecord};
use crate::storage::traits::{ScheduleStore, StorageError, TelemetrySink, TriggerStore};
use crate::telemetry::TelemetryEvent;
use crate::trigger::{TriggerId, TriggerRow};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Counter of injected failures.
#[derive(Debug, Default)]
struct FailureBudget(AtomicUsize);

impl FailureBudget {
    fn set(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn check(&self, context: &'static str) -> Result<(), StorageError> {
        let took = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StorageError::ConnectionError(format!("injected failure: {context}")));
        }
        Ok(())
    }
}

/// Thread-safe in-memory trigger store.
#[derive(Debug, Default)]
pub struct InMemoryTriggerStore {
    rows: RwLock<Vec<TriggerRow>>,
    failures: FailureBudget,
}

impl InMemoryTriggerStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a connection error.
    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }

    /// Insert a raw row as-is, bypassing any validation.
    pub fn insert_raw(&self, row: TriggerRow) -> Result<(), StorageError> {
        let mut rows = self.rows.write().map_err(|_| lock_err("trigger.insert_raw"))?;
        rows.push(row);
        Ok(())
    }

    /// The persisted last fire time of a trigger.
    pub fn last_fired(&self, id: TriggerId) -> Result<Option<f64>, StorageError> {
        let rows = self.rows.read().map_err(|_| lock_err("trigger.last_fired"))?;
        Ok(rows.iter().find(|r| r.id == id).map(|r| r.last_fired_at))
    }
}

impl TriggerStore for InMemoryTriggerStore {
    fn list_triggers(&self) -> Result<Vec<TriggerRow>, StorageError> {
        self.failures.check("trigger.list")?;
        let rows = self.rows.read().map_err(|_| lock_err("trigger.list"))?;
        Ok(rows.clone())
    }

    fn insert_trigger(&self, row: TriggerRow) -> Result<TriggerId, StorageError> {
        self.failures.check("trigger.insert")?;
        let mut rows = self.rows.write().map_err(|_| lock_err("trigger.insert"))?;
        if rows.iter().any(|r| r.id == row.id) {
            return Err(StorageError::DuplicateKey(row.id.to_string()));
        }
        let id = row.id;
        rows.push(row);
        Ok(id)
    }

    fn delete_trigger(&self, id: TriggerId) -> Result<bool, StorageError> {
        self.failures.check("trigger.delete")?;
        let mut rows = self.rows.write().map_err(|_| lock_err("trigger.delete"))?;
        let before = rows.len();
        rows.retain(|r| r.id != id);
        Ok(rows.len() != before)
    }

    fn update_last_fired(&self, id: TriggerId, timestamp: f64) -> Result<(), StorageError> {
        self.failures.check("trigger.update_last_fired")?;
        let mut rows = self.rows.write().map_err(|_| lock_err("trigger.update_last_fired"))?;
        if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
            row.last_fired_at = timestamp;
        }
        Ok(())
    }
}

/// Thread-safe in-memory schedule store.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    rows: RwLock<Vec<ScheduleRecord>>,
    failures: FailureBudget,
}

impl InMemoryScheduleStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a connection error.
    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, StorageError> {
        self.failures.check("schedule.list")?;
        let rows = self.rows.read().map_err(|_| lock_err("schedule.list"))?;
        Ok(rows.clone())
    }

    fn insert_schedule(&self, record: ScheduleRecord) -> Result<ScheduleId, StorageError> {
        self.failures.check("schedule.insert")?;
        let mut rows = self.rows.write().map_err(|_| lock_err("schedule.insert"))?;
        if rows.iter().any(|r| r.id == record.id) {
            return Err(StorageError::DuplicateKey(record.id.to_string()));
        }
        let id = record.id;
        rows.push(record);
        Ok(id)
    }

    fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StorageError> {
        self.failures.check("schedule.delete")?;
        let mut rows = self.rows.write().map_err(|_| lock_err("schedule.delete"))?;
        let before = rows.len();
        rows.retain(|r| r.id != id);
        Ok(rows.len() != before)
    }

    fn read_schedule_enabled(&self, id: ScheduleId) -> Result<Option<bool>, StorageError> {
        self.failures.check("schedule.read_enabled")?;
        let rows = self.rows.read().map_err(|_| lock_err("schedule.read_enabled"))?;
        Ok(rows.iter().find(|r| r.id == id).map(|r| r.enabled))
    }

    fn set_schedule_enabled(&self, id: ScheduleId, enabled: bool) -> Result<bool, StorageError> {
        self.failures.check("schedule.set_enabled")?;
        let mut rows = self.rows.write().map_err(|_| lock_err("schedule.set_enabled"))?;
        match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Telemetry sink that keeps every batch in memory.
#[derive(Debug, Default)]
pub struct InMemorySink {
    batches: RwLock<Vec<Vec<TelemetryEvent>>>,
    failures: FailureBudget,
}

impl InMemorySink {
    /// Create a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch writes fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }

    /// Sizes of every successfully written batch, in order.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .read()
            .map(|b| b.iter().map(Vec::len).collect())
            .unwrap_or_default()
    }

    /// All successfully written rows, flattened.
    #[must_use]
    pub fn rows(&self) -> Vec<TelemetryEvent> {
        self.batches
            .read()
            .map(|b| b.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

impl TelemetrySink for InMemorySink {
    fn insert_batch(&self, rows: &[TelemetryEvent]) -> Result<(), StorageError> {
        self.failures.check("sink.insert_batch")?;
        let mut batches = self.batches.write().map_err(|_| lock_err("sink.insert_batch"))?;
        batches.push(rows.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::NewTrigger;

    #[test]
    fn trigger_store_preserves_insertion_order() {
        let store = InMemoryTriggerStore::new();
        let a = store.insert_trigger(NewTrigger::reply("a", "1").into_row(TriggerId::new())).unwrap();
        let b = store.insert_trigger(NewTrigger::reply("b", "2").into_row(TriggerId::new())).unwrap();
        let ids: Vec<_> = store.list_triggers().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b]);

        assert!(store.delete_trigger(a).unwrap());
        assert!(!store.delete_trigger(a).unwrap());
    }

    #[test]
    fn update_last_fired_on_missing_row_is_ok() {
        let store = InMemoryTriggerStore::new();
        store.update_last_fired(TriggerId::new(), 5.0).unwrap();
    }

    #[test]
    fn injected_failures_are_consumed() {
        let store = InMemoryScheduleStore::new();
        store.fail_next(1);
        assert!(store.list_schedules().is_err());
        assert!(store.list_schedules().is_ok());
    }

    #[test]
    fn schedule_enabled_round_trip() {
        let store = InMemoryScheduleStore::new();
        let id = store
            .insert_schedule(ScheduleRecord {
                id: ScheduleId::new(),
                message: "hi".to_string(),
                interval_minutes: 1,
                enabled: true,
            })
            .unwrap();
        assert_eq!(store.read_schedule_enabled(id).unwrap(), Some(true));
        assert!(store.set_schedule_enabled(id, false).unwrap());
        assert_eq!(store.read_schedule_enabled(id).unwrap(), Some(false));
        assert!(store.delete_schedule(id).unwrap());
        assert_eq!(store.read_schedule_enabled(id).unwrap(), None);
    }
}
