//! # ChatReflex - a concurrent chat auto-responder core
//!
//! ChatReflex matches a live stream of chat messages against a hot-swappable
//! set of regex triggers, fires replies or structured alerts under per-trigger
//! cooldowns, drives persisted interval broadcasts, and batches activity
//! telemetry to a sink.
//!
//! ## Core Concepts
//!
//! - **Trigger**: a pattern-to-action rule (reply or alert) with a cooldown
//! - **Snapshot**: an immutable, atomically published copy of the trigger set
//! - **Schedule**: a persisted, independently timed periodic broadcast
//! - **Liveness probe**: a host signal for "the session is live right now"
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chatreflex::{MatchEngine, NewTrigger, TriggerCache, InMemoryTriggerStore};
//!
//! let store = Arc::new(InMemoryTriggerStore::new());
//! let cache = Arc::new(TriggerCache::new(store));
//! cache.start_auto_refresh(None, std::time::Duration::from_secs(1800))?;
//!
//! let engine = MatchEngine::new(Arc::clone(&cache))?;
//! engine.add_trigger(NewTrigger::reply("hello", "Hi!"))?;
//!
//! let reply = Arc::new(|text: &str| { println!("{text}"); Ok(()) });
//! engine.handle_message("viewer", "hello there", reply)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Records and contracts
pub mod clock;
pub mod error;
pub mod liveness;
pub mod schedule;
pub mod storage;
pub mod trigger;

// Runtime components
pub mod cache;
pub mod config;
pub mod matching;
pub(crate) mod runtime;
pub mod scheduler;
pub mod telemetry;

pub use cache::{ListenerError, ListenerId, SnapshotListener, TriggerCache, TriggerCacheConfig, TriggerSnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReflexConfig;
pub use error::{DeliveryError, ExecutionError, ReflexError, ReflexResult, ValidationError};
pub use liveness::{AlwaysLive, LivenessProbe, StreamState};
pub use matching::{AlertHandler, AlertPayload, MatchEngine, MatchEngineBuilder, MatchEngineConfig, MatchHandle, ReplySink};
pub use schedule::{ScheduleId, ScheduleRecord, ScheduleState};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use storage::{
    InMemoryScheduleStore, InMemorySink, InMemoryTriggerStore, ScheduleStore, StorageError, TelemetrySink,
    TriggerStore,
};
pub use telemetry::{CloseOptions, EventType, TelemetryBatcher, TelemetryConfig, TelemetryEvent};
pub use trigger::{AlertMapping, NewTrigger, ResponseKind, TriggerId, TriggerRecord, TriggerResponse, TriggerRow};
