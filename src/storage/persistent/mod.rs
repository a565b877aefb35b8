//! Persistent storage backend.
//!
//! Durable, crash-tolerant storage for triggers and schedules:
//! - append-only log with CRC32-checked records, replayed on open
//! - exclusive directory lock so one process owns the data
//! - compaction once the log outgrows its budget
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │            PersistentStores            │
//! │  in-memory rows  ←  replay  ← WAL file │
//! │        ↑                        ↑      │
//! │     reads             appends (fsync)  │
//! │        FileLock (chatreflex.lock)      │
//! └────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use stores::PersistentStores;
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{ReflexError, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Whether to fsync after every append (slower but safer).
    pub sync_on_write: bool,
    /// Log size that triggers compaction (bytes).
    pub max_wal_size: u64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_wal_size: 8 * 1024 * 1024, // 8 MB
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // avoids compacting on every write

    /// Check the configuration.
    pub fn validate(self) -> Result<Self, ReflexError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                field: "max_wal_size".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            }
            .into());
        }
        Ok(self)
    }
}

/// Open or create a store at `path`.
///
/// # Errors
/// - the directory cannot be created or accessed
/// - another process holds the lock
/// - the log header is unreadable
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use chatreflex::storage::open_store;
///
/// let stores = Arc::new(open_store("./chatreflex-data", None)?);
/// let cache = TriggerCache::new(stores.clone());
/// ```
pub fn open_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentStores, ReflexError> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentStores::open(path.as_ref(), cfg)
}
