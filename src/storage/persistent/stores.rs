//! Durable store implementation.
//!
//! State lives in memory and every mutation is appended to the log first.
//! The state lock is held across append + apply so the log order always
//! matches the in-memory order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{ExecutionError, ReflexError};
use crate::schedule::{ScheduleId, ScheduleRecord};
use crate::storage::traits::{ScheduleStore, StorageError, TriggerStore};
use crate::trigger::{TriggerId, TriggerRow};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "chatreflex.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

fn open_err(message: String) -> ReflexError {
    ReflexError::Execution(ExecutionError::Storage { message })
}

#[derive(Debug, Default)]
struct StoreState {
    triggers: Vec<TriggerRow>,
    schedules: Vec<ScheduleRecord>,
}

impl StoreState {
    fn apply(&mut self, kind: &WalEntryKind) {
        match kind {
            WalEntryKind::TriggerInsert(row) => {
                self.triggers.retain(|r| r.id != row.id);
                self.triggers.push(row.clone());
            }
            WalEntryKind::TriggerDelete { id } => self.triggers.retain(|r| r.id != *id),
            WalEntryKind::TriggerFired { id, timestamp } => {
                if let Some(row) = self.triggers.iter_mut().find(|r| r.id == *id) {
                    row.last_fired_at = *timestamp;
                }
            }
            WalEntryKind::ScheduleInsert(rec) => {
                self.schedules.retain(|r| r.id != rec.id);
                self.schedules.push(rec.clone());
            }
            WalEntryKind::ScheduleDelete { id } => self.schedules.retain(|r| r.id != *id),
            WalEntryKind::ScheduleEnabled { id, enabled } => {
                if let Some(rec) = self.schedules.iter_mut().find(|r| r.id == *id) {
                    rec.enabled = *enabled;
                }
            }
        }
    }

    /// The minimal log that rebuilds this state.
    fn as_log(&self) -> Vec<WalEntryKind> {
        self.triggers
            .iter()
            .cloned()
            .map(WalEntryKind::TriggerInsert)
            .chain(self.schedules.iter().cloned().map(WalEntryKind::ScheduleInsert))
            .collect()
    }
}

/// Trigger and schedule store persisted in a data directory.
///
/// Implements both [`TriggerStore`] and [`ScheduleStore`]; share it behind an
/// `Arc` and hand the same handle to the cache, engine and scheduler.
pub struct PersistentStores {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    config: PersistentConfig,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for PersistentStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStores")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentStores {
    /// Open or create the store in `dir`.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, ReflexError> {
        fs::create_dir_all(dir).map_err(|e| open_err(format!("failed to create data directory: {e}")))?;

        let lock = FileLock::acquire(dir).map_err(|e| open_err(format!("failed to acquire lock: {e}")))?;

        let (wal, entries) = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| open_err(format!("failed to open log: {e}")))?;

        let mut state = StoreState::default();
        for entry in &entries {
            state.apply(&entry.kind);
        }
        tracing::debug!(
            dir = %dir.display(),
            entries = entries.len(),
            triggers = state.triggers.len(),
            schedules = state.schedules.len(),
            "replayed store log"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            config,
            state: RwLock::new(state),
        })
    }

    /// The data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append + apply under the state write lock, compacting when the log
    /// outgrows its budget.
    ///
    /// The write is durable once appended; a failed compaction is logged and
    /// retried on the next commit.
    fn commit(&self, kind: WalEntryKind, context: &'static str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(context))?;
        self.wal.append(kind.clone()).map_err(|e| io_err(context, &e))?;
        state.apply(&kind);

        match self.wal.size_bytes() {
            Ok(size) if size > self.config.max_wal_size => match self.wal.rewrite(state.as_log()) {
                Ok(()) => tracing::debug!(before_bytes = size, "compacted store log"),
                Err(e) => tracing::warn!(size_bytes = size, error = %e, "store log compaction failed"),
            },
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cannot size store log; skipping compaction"),
        }
        Ok(())
    }

    /// Rewrite the log with only live state.
    pub fn compact(&self) -> Result<(), StorageError> {
        let state = self.state.read().map_err(|_| lock_err("compact"))?;
        self.wal.rewrite(state.as_log()).map_err(|e| io_err("compaction", &e))
    }
}

impl TriggerStore for PersistentStores {
    fn list_triggers(&self) -> Result<Vec<TriggerRow>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger.list"))?;
        Ok(state.triggers.clone())
    }

    fn insert_trigger(&self, row: TriggerRow) -> Result<TriggerId, StorageError> {
        {
            let state = self.state.read().map_err(|_| lock_err("trigger.insert"))?;
            if state.triggers.iter().any(|r| r.id == row.id) {
                return Err(StorageError::DuplicateKey(row.id.to_string()));
            }
        }
        let id = row.id;
        self.commit(WalEntryKind::TriggerInsert(row), "trigger.insert")?;
        Ok(id)
    }

    fn delete_trigger(&self, id: TriggerId) -> Result<bool, StorageError> {
        let exists = {
            let state = self.state.read().map_err(|_| lock_err("trigger.delete"))?;
            state.triggers.iter().any(|r| r.id == id)
        };
        if !exists {
            return Ok(false);
        }
        self.commit(WalEntryKind::TriggerDelete { id }, "trigger.delete")?;
        Ok(true)
    }

    fn update_last_fired(&self, id: TriggerId, timestamp: f64) -> Result<(), StorageError> {
        self.commit(WalEntryKind::TriggerFired { id, timestamp }, "trigger.update_last_fired")
    }
}

impl ScheduleStore for PersistentStores {
    fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("schedule.list"))?;
        Ok(state.schedules.clone())
    }

    fn insert_schedule(&self, record: ScheduleRecord) -> Result<ScheduleId, StorageError> {
        {
            let state = self.state.read().map_err(|_| lock_err("schedule.insert"))?;
            if state.schedules.iter().any(|r| r.id == record.id) {
                return Err(StorageError::DuplicateKey(record.id.to_string()));
            }
        }
        let id = record.id;
        self.commit(WalEntryKind::ScheduleInsert(record), "schedule.insert")?;
        Ok(id)
    }

    fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StorageError> {
        let exists = {
            let state = self.state.read().map_err(|_| lock_err("schedule.delete"))?;
            state.schedules.iter().any(|r| r.id == id)
        };
        if !exists {
            return Ok(false);
        }
        self.commit(WalEntryKind::ScheduleDelete { id }, "schedule.delete")?;
        Ok(true)
    }

    fn read_schedule_enabled(&self, id: ScheduleId) -> Result<Option<bool>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("schedule.read_enabled"))?;
        Ok(state.schedules.iter().find(|r| r.id == id).map(|r| r.enabled))
    }

    fn set_schedule_enabled(&self, id: ScheduleId, enabled: bool) -> Result<bool, StorageError> {
        let exists = {
            let state = self.state.read().map_err(|_| lock_err("schedule.set_enabled"))?;
            state.schedules.iter().any(|r| r.id == id)
        };
        if !exists {
            return Ok(false);
        }
        self.commit(WalEntryKind::ScheduleEnabled { id, enabled }, "schedule.set_enabled")?;
        Ok(true)
    }
}
