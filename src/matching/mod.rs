//! Message matching and trigger firing.
//!
//! `handle_message` hands the scan to a worker pool so the ingest loop never
//! waits on regex evaluation. Workers read the active trigger list through a
//! shared guard and clone its `Arc`, so a concurrent snapshot swap is seen
//! either entirely or not at all.
//!
//! Cooldown checks and marks happen under one lock per message-trigger pair.
//! The new `last_fired_at` is written back to the store on a separate
//! single-worker queue; per trigger the last write wins.

mod alert;
mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde_json::{Map, Value};

use crate::cache::{ListenerError, ListenerId, TriggerCache, TriggerSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::error::{ExecutionError, ReflexError, ReflexResult, ValidationError};
use crate::runtime::WorkerPool;
use crate::storage::TriggerStore;
use crate::telemetry::TelemetryBatcher;
use crate::trigger::{NewTrigger, TriggerId, TriggerRecord, TriggerResponse};

pub use alert::AlertPayload;
pub use transport::{AlertHandler, ReplySink};

use alert::{build_payload, AlertSource};
pub(crate) use transport::send_reply;

/// Match engine tuning.
#[derive(Debug, Clone)]
pub struct MatchEngineConfig {
    /// Threads scanning inbound messages.
    pub workers: usize,
    /// Max queued messages before `handle_message` rejects.
    pub queue_capacity: usize,
    /// Max queued cooldown writes before new ones are dropped.
    pub persist_queue_capacity: usize,
    /// Channel name recorded on telemetry events.
    pub channel: String,
}

impl Default for MatchEngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
            persist_queue_capacity: 1024,
            channel: String::new(),
        }
    }
}

impl MatchEngineConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails when any worker count or capacity is zero.
    pub fn validate(self) -> ReflexResult<Self> {
        for (field, value) in [
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("persist_queue_capacity", self.persist_queue_capacity),
        ] {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                }
                .into());
            }
        }
        Ok(self)
    }
}

/// Pending result of one `handle_message` call.
#[derive(Debug)]
pub struct MatchHandle {
    rx: Receiver<Vec<TriggerId>>,
}

impl MatchHandle {
    /// Wait for the scan to finish; yields fired trigger ids in snapshot order.
    ///
    /// # Errors
    ///
    /// Fails if the worker dropped the job (engine shut down or job panicked).
    pub fn join(self) -> ReflexResult<Vec<TriggerId>> {
        self.rx.recv().map_err(|_| {
            ReflexError::Execution(ExecutionError::Disconnected {
                path: "match".to_string(),
            })
        })
    }

    /// Wait up to `timeout` for the scan to finish.
    ///
    /// # Errors
    ///
    /// Fails on timeout or if the worker dropped the job.
    pub fn join_timeout(self, timeout: Duration) -> ReflexResult<Vec<TriggerId>> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ReflexError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => ReflexError::Execution(ExecutionError::Disconnected {
                path: "match".to_string(),
            }),
        })
    }
}

type TriggerList = Arc<Vec<Arc<TriggerRecord>>>;

#[derive(Debug)]
struct EngineTriggers {
    generation: u64,
    list: TriggerList,
}

struct EngineInner {
    store: Arc<dyn TriggerStore>,
    triggers: RwLock<EngineTriggers>,
    cooldowns: Mutex<HashMap<TriggerId, f64>>,
    persist: WorkerPool,
    alerts: Option<AlertHandler>,
    telemetry: Option<Arc<TelemetryBatcher>>,
    clock: Arc<dyn Clock>,
    channel: String,
}

impl EngineInner {
    fn active(&self) -> TriggerList {
        match self.triggers.read() {
            Ok(t) => Arc::clone(&t.list),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().list),
        }
    }

    fn apply_snapshot(&self, snapshot: &TriggerSnapshot) {
        {
            let Ok(mut triggers) = self.triggers.write() else {
                return;
            };
            if snapshot.generation() <= triggers.generation {
                return;
            }
            triggers.generation = snapshot.generation();
            triggers.list = Arc::new(snapshot.triggers().to_vec());
        }

        // Cooldowns of triggers that left the set.
        let live: HashSet<TriggerId> = snapshot.triggers().iter().map(|t| t.id).collect();
        if let Ok(mut ledger) = self.cooldowns.lock() {
            ledger.retain(|id, _| live.contains(id));
        }
    }

    fn update_list(&self, f: impl FnOnce(&mut Vec<Arc<TriggerRecord>>)) -> ReflexResult<()> {
        let mut triggers = self
            .triggers
            .write()
            .map_err(|_| ReflexError::internal("match trigger lock poisoned"))?;
        let mut next = triggers.list.as_ref().clone();
        f(&mut next);
        triggers.list = Arc::new(next);
        Ok(())
    }

    /// Atomically check the cooldown and mark the trigger fired at `now`.
    fn try_mark_fired(&self, trigger: &TriggerRecord, now: f64) -> bool {
        let Ok(mut ledger) = self.cooldowns.lock() else {
            return false;
        };
        let last = ledger
            .get(&trigger.id)
            .copied()
            .unwrap_or(0.0)
            .max(trigger.last_fired_at);
        if !trigger.is_ready(last, now) {
            return false;
        }
        ledger.insert(trigger.id, now);
        true
    }

    fn persist_last_fired(&self, id: TriggerId, timestamp: f64) {
        let store = Arc::clone(&self.store);
        let job = Box::new(move || {
            if let Err(e) = store.update_last_fired(id, timestamp) {
                tracing::warn!(trigger_id = %id, error = %e, "failed to persist trigger fire time");
            }
        });
        if let Err(e) = self.persist.try_submit(job) {
            tracing::warn!(trigger_id = %id, error = %e, "dropping trigger fire-time update");
        }
    }

    fn process(&self, author: &str, content: &str, reply: &dyn ReplySink) -> Vec<TriggerId> {
        let triggers = self.active();
        let now = self.clock.now_secs();
        let mut fired = Vec::new();

        for trigger in triggers.iter() {
            if !trigger.is_match(content) || !self.try_mark_fired(trigger, now) {
                continue;
            }
            fired.push(trigger.id);
            self.persist_last_fired(trigger.id, now);

            match &trigger.response {
                TriggerResponse::Reply { text } => {
                    if let Err(e) = send_reply(reply, text) {
                        tracing::warn!(trigger_id = %trigger.id, error = %e, "reply delivery failed");
                    }
                }
                TriggerResponse::Alert { mapping } => {
                    if let Some(handler) = self.alerts.as_ref() {
                        let source = AlertSource {
                            author,
                            content,
                            timestamp: now,
                            captures: trigger.pattern.captures(content),
                        };
                        let payload = build_payload(trigger, mapping, &source);
                        if let Err(e) = handler.deliver(payload) {
                            tracing::warn!(trigger_id = %trigger.id, error = %e, "alert delivery failed");
                        }
                    } else {
                        tracing::debug!(trigger_id = %trigger.id, "alert fired with no handler registered");
                    }
                }
            }

            if let Some(telemetry) = self.telemetry.as_ref() {
                let mut details = Map::new();
                details.insert("trigger_id".to_string(), Value::String(trigger.id.to_string()));
                details.insert("user".to_string(), Value::String(author.to_string()));
                telemetry.log_trigger_event(&self.channel, trigger.pattern.as_str(), kind_name(trigger), details);
            }
        }

        if let Some(telemetry) = self.telemetry.as_ref() {
            let mut details = Map::new();
            details.insert("message".to_string(), Value::String(content.to_string()));
            let name = fired
                .first()
                .and_then(|id| triggers.iter().find(|t| t.id == *id))
                .map(|t| t.pattern.as_str().to_string());
            telemetry.log_chat(&self.channel, author, !fired.is_empty(), name, details);
        }

        if !fired.is_empty() {
            tracing::debug!(author, fired = fired.len(), "triggers fired");
        }
        fired
    }
}

fn kind_name(trigger: &TriggerRecord) -> &'static str {
    match trigger.response {
        TriggerResponse::Reply { .. } => "reply",
        TriggerResponse::Alert { .. } => "alert",
    }
}

/// Builder for [`MatchEngine`].
pub struct MatchEngineBuilder {
    cache: Arc<TriggerCache>,
    config: MatchEngineConfig,
    alerts: Option<AlertHandler>,
    telemetry: Option<Arc<TelemetryBatcher>>,
    clock: Arc<dyn Clock>,
}

impl MatchEngineBuilder {
    /// Override the engine settings.
    #[must_use]
    pub fn config(mut self, config: MatchEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the ALERT handler.
    #[must_use]
    pub fn alert_handler(mut self, handler: AlertHandler) -> Self {
        self.alerts = Some(handler);
        self
    }

    /// Record chat and trigger events.
    #[must_use]
    pub fn telemetry(mut self, batcher: Arc<TelemetryBatcher>) -> Self {
        self.telemetry = Some(batcher);
        self
    }

    /// Use a custom clock for cooldown arithmetic.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the engine and subscribe it to the cache.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid.
    pub fn build(self) -> ReflexResult<MatchEngine> {
        let config = self.config.validate()?;
        let current = self.cache.list();

        let inner = Arc::new(EngineInner {
            store: self.cache.store(),
            triggers: RwLock::new(EngineTriggers {
                generation: current.generation(),
                list: Arc::new(current.triggers().to_vec()),
            }),
            cooldowns: Mutex::new(HashMap::new()),
            persist: WorkerPool::start("persist", 1, config.persist_queue_capacity),
            alerts: self.alerts,
            telemetry: self.telemetry,
            clock: self.clock,
            channel: config.channel.clone(),
        });

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let listener = self.cache.register_listener(Arc::new(move |snapshot: &Arc<TriggerSnapshot>| -> Result<(), ListenerError> {
            if let Some(inner) = weak.upgrade() {
                inner.apply_snapshot(snapshot);
            }
            Ok(())
        }));
        // Catch a snapshot published before the listener was in place.
        inner.apply_snapshot(&self.cache.list());

        let pool = WorkerPool::start("match", config.workers, config.queue_capacity);
        tracing::info!(workers = config.workers, triggers = current.len(), "match engine started");

        Ok(MatchEngine {
            inner,
            pool,
            cache: self.cache,
            listener,
        })
    }
}

/// Scans inbound messages against the active triggers and fires them.
pub struct MatchEngine {
    inner: Arc<EngineInner>,
    pool: WorkerPool,
    cache: Arc<TriggerCache>,
    listener: ListenerId,
}

impl MatchEngine {
    /// Start configuring an engine fed by `cache`.
    #[must_use]
    pub fn builder(cache: Arc<TriggerCache>) -> MatchEngineBuilder {
        MatchEngineBuilder {
            cache,
            config: MatchEngineConfig::default(),
            alerts: None,
            telemetry: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Engine with default settings and no alert handler.
    ///
    /// # Errors
    ///
    /// See [`MatchEngineBuilder::build`].
    pub fn new(cache: Arc<TriggerCache>) -> ReflexResult<Self> {
        Self::builder(cache).build()
    }

    /// Queue `content` from `author` for matching.
    ///
    /// Never blocks on matching, delivery or persistence. Delivery failures
    /// are logged; the returned handle only reports which triggers fired.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the worker queue is saturated.
    pub fn handle_message(
        &self,
        author: impl Into<String>,
        content: impl Into<String>,
        reply: Arc<dyn ReplySink>,
    ) -> ReflexResult<MatchHandle> {
        let author = author.into();
        let content = content.into();
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = bounded::<Vec<TriggerId>>(1);

        self.pool.try_submit(Box::new(move || {
            let fired = inner.process(&author, &content, reply.as_ref());
            let _ = tx.send(fired);
        }))?;
        Ok(MatchHandle { rx })
    }

    /// Ids of active triggers whose pattern matches `content`, ignoring
    /// cooldowns and without firing anything.
    #[must_use]
    pub fn matching(&self, content: &str) -> Vec<TriggerId> {
        self.inner
            .active()
            .iter()
            .filter(|t| t.is_match(content))
            .map(|t| t.id)
            .collect()
    }

    /// Number of triggers this engine currently scans.
    #[must_use]
    pub fn trigger_count(&self) -> usize {
        self.inner.active().len()
    }

    /// Persist a new trigger and start matching it immediately.
    ///
    /// # Errors
    ///
    /// Fails validation for a bad pattern or response, or when the store
    /// rejects the write.
    pub fn add_trigger(&self, trigger: NewTrigger) -> ReflexResult<TriggerId> {
        trigger.validate()?;
        let row = trigger.into_row(TriggerId::new());
        let record = Arc::new(TriggerRecord::compile(&row)?);
        let id = self.inner.store.insert_trigger(row)?;
        // A refresh between the insert and here may already list the row.
        self.inner.update_list(|list| {
            if !list.iter().any(|t| t.id == record.id) {
                list.push(record);
            }
        })?;
        tracing::info!(trigger_id = %id, "trigger added");
        Ok(id)
    }

    /// Delete a trigger from the store and stop matching it.
    ///
    /// Returns whether the store held the row.
    ///
    /// # Errors
    ///
    /// Fails when the store rejects the delete.
    pub fn remove_trigger(&self, id: TriggerId) -> ReflexResult<bool> {
        let removed = self.inner.store.delete_trigger(id)?;
        self.inner.update_list(|list| list.retain(|t| t.id != id))?;
        if let Ok(mut ledger) = self.inner.cooldowns.lock() {
            ledger.remove(&id);
        }
        tracing::info!(trigger_id = %id, removed, "trigger removed");
        Ok(removed)
    }
}

impl Drop for MatchEngine {
    fn drop(&mut self) {
        self.cache.unregister_listener(self.listener);
        // Drain in-flight scans before the persistence queue goes away.
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for MatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchEngine")
            .field("triggers", &self.trigger_count())
            .field("channel", &self.inner.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::DeliveryError;
    use crate::storage::InMemoryTriggerStore;

    fn recorder() -> (Arc<dyn ReplySink>, Arc<Mutex<Vec<String>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&out);
        let sink: Arc<dyn ReplySink> = Arc::new(move |text: &str| -> Result<(), DeliveryError> {
            o.lock().unwrap().push(text.to_string());
            Ok(())
        });
        (sink, out)
    }

    #[test]
    fn add_trigger_is_visible_without_refresh() {
        let cache = Arc::new(TriggerCache::new(Arc::new(InMemoryTriggerStore::new())));
        let engine = MatchEngine::new(Arc::clone(&cache)).unwrap();
        let id = engine.add_trigger(NewTrigger::reply("ping", "pong")).unwrap();
        assert_eq!(engine.matching("ping!"), vec![id]);
        assert!(cache.list().is_empty());

        assert!(engine.remove_trigger(id).unwrap());
        assert!(engine.matching("ping!").is_empty());
    }

    #[test]
    fn invalid_trigger_is_rejected() {
        let cache = Arc::new(TriggerCache::new(Arc::new(InMemoryTriggerStore::new())));
        let engine = MatchEngine::new(cache).unwrap();
        let err = engine.add_trigger(NewTrigger::reply("(", "x")).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(engine.trigger_count(), 0);
    }

    #[test]
    fn cooldown_ledger_blocks_refire() {
        let cache = Arc::new(TriggerCache::new(Arc::new(InMemoryTriggerStore::new())));
        let clock = Arc::new(ManualClock::new(1_000.0));
        let engine = MatchEngine::builder(cache).clock(clock.clone()).build().unwrap();
        engine.add_trigger(NewTrigger::reply("hey", "yo").with_cooldown(2)).unwrap();
        let (sink, out) = recorder();

        assert_eq!(engine.handle_message("a", "hey", Arc::clone(&sink)).unwrap().join().unwrap().len(), 1);
        clock.advance(119.0);
        assert!(engine.handle_message("a", "hey", Arc::clone(&sink)).unwrap().join().unwrap().is_empty());
        clock.advance(1.0);
        assert_eq!(engine.handle_message("a", "hey", sink).unwrap().join().unwrap().len(), 1);
        assert_eq!(out.lock().unwrap().len(), 2);
    }

    #[test]
    fn stale_snapshot_generation_is_ignored() {
        let store = Arc::new(InMemoryTriggerStore::new());
        store.insert_trigger(NewTrigger::reply("a", "1").into_row(TriggerId::new())).unwrap();
        let cache = Arc::new(TriggerCache::new(store));
        cache.refresh().unwrap();
        let engine = MatchEngine::new(Arc::clone(&cache)).unwrap();
        assert_eq!(engine.trigger_count(), 1);

        engine.inner.apply_snapshot(&TriggerSnapshot::empty());
        assert_eq!(engine.trigger_count(), 1);
    }

    /// Refreshes the cache from inside `insert_trigger`, landing a snapshot
    /// between the store write and the engine's own list update.
    struct RefreshingStore {
        rows: InMemoryTriggerStore,
        cache: std::sync::OnceLock<Weak<TriggerCache>>,
    }

    impl TriggerStore for RefreshingStore {
        fn list_triggers(&self) -> Result<Vec<crate::trigger::TriggerRow>, crate::storage::StorageError> {
            self.rows.list_triggers()
        }

        fn insert_trigger(&self, row: crate::trigger::TriggerRow) -> Result<TriggerId, crate::storage::StorageError> {
            let id = self.rows.insert_trigger(row)?;
            if let Some(cache) = self.cache.get().and_then(Weak::upgrade) {
                cache.refresh();
            }
            Ok(id)
        }

        fn delete_trigger(&self, id: TriggerId) -> Result<bool, crate::storage::StorageError> {
            self.rows.delete_trigger(id)
        }

        fn update_last_fired(&self, id: TriggerId, timestamp: f64) -> Result<(), crate::storage::StorageError> {
            self.rows.update_last_fired(id, timestamp)
        }
    }

    #[test]
    fn add_trigger_racing_a_refresh_is_listed_once() {
        let store = Arc::new(RefreshingStore {
            rows: InMemoryTriggerStore::new(),
            cache: std::sync::OnceLock::new(),
        });
        let cache = Arc::new(TriggerCache::new(store.clone()));
        store.cache.set(Arc::downgrade(&cache)).unwrap();
        let engine = MatchEngine::new(Arc::clone(&cache)).unwrap();

        let id = engine.add_trigger(NewTrigger::reply("hello", "Hi!")).unwrap();
        assert_eq!(cache.list().len(), 1);
        assert_eq!(engine.trigger_count(), 1);
        assert_eq!(engine.matching("hello"), vec![id]);

        let (sink, out) = recorder();
        let fired = engine.handle_message("a", "hello", sink).unwrap().join().unwrap();
        assert_eq!(fired, vec![id]);
        assert_eq!(*out.lock().unwrap(), vec!["Hi!".to_string()]);
    }

    #[test]
    fn engine_built_during_refreshes_ends_on_latest_snapshot() {
        let store = Arc::new(InMemoryTriggerStore::new());
        let cache = Arc::new(TriggerCache::new(store.clone()));

        let refresher = {
            let cache = Arc::clone(&cache);
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for n in 0..50 {
                    store
                        .insert_trigger(NewTrigger::reply(format!("p{n}"), "r").into_row(TriggerId::new()))
                        .unwrap();
                    cache.refresh().unwrap();
                }
            })
        };
        let engines: Vec<MatchEngine> = (0..20).map(|_| MatchEngine::new(Arc::clone(&cache)).unwrap()).collect();
        refresher.join().unwrap();

        for engine in &engines {
            assert_eq!(engine.trigger_count(), 50);
        }
    }

    #[test]
    fn snapshot_prunes_cooldowns_of_removed_triggers() {
        let store = Arc::new(InMemoryTriggerStore::new());
        let id = store
            .insert_trigger(NewTrigger::reply("hey", "yo").with_cooldown(5).into_row(TriggerId::new()))
            .unwrap();
        let cache = Arc::new(TriggerCache::new(store.clone()));
        cache.refresh().unwrap();
        let engine = MatchEngine::new(Arc::clone(&cache)).unwrap();

        let (sink, _out) = recorder();
        assert_eq!(engine.handle_message("a", "hey", sink).unwrap().join().unwrap(), vec![id]);
        assert!(engine.inner.cooldowns.lock().unwrap().contains_key(&id));

        store.delete_trigger(id).unwrap();
        cache.notify_change().unwrap();
        assert_eq!(engine.trigger_count(), 0);
        assert!(engine.inner.cooldowns.lock().unwrap().is_empty());
    }
}
