//! Storage contracts and backends.
//!
//! The runtime only depends on the traits; `InMemory*` backends serve tests
//! and embedding, the `persistent` feature adds a durable on-disk store.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryScheduleStore, InMemorySink, InMemoryTriggerStore};
pub use traits::{ScheduleStore, StorageError, TelemetrySink, TriggerStore};

#[cfg(feature = "persistent")]
pub use persistent::{open_store, PersistentConfig, PersistentStores};
