//! Hot-swappable trigger cache.
//!
//! The cache owns the authoritative compiled view of the trigger table. Each
//! `refresh` reads every row from the store, compiles it, and publishes a new
//! [`TriggerSnapshot`] by swapping one `Arc` under a short write lock. Readers
//! clone the `Arc` and never observe a partially built snapshot.
//!
//! Construct one cache per store handle and pass it to consumers.

mod listeners;
mod snapshot;

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{ReflexError, ReflexResult, ValidationError};
use crate::liveness::LivenessProbe;
use crate::runtime::{BackgroundTask, StopSignal};
use crate::storage::TriggerStore;
use crate::trigger::TriggerRecord;

pub use listeners::{ListenerError, ListenerId, SnapshotListener};
pub use snapshot::TriggerSnapshot;

use listeners::ListenerSet;

/// Trigger cache tuning.
#[derive(Debug, Clone)]
pub struct TriggerCacheConfig {
    /// Period between automatic refreshes.
    pub refresh_interval: Duration,
    /// Sleep granularity of the auto-refresh loop; bounds stop latency.
    pub poll_step: Duration,
    /// How long `stop_auto_refresh` waits for the loop to exit.
    pub join_timeout: Duration,
}

impl Default for TriggerCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1800),
            poll_step: Duration::from_secs(1),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl TriggerCacheConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails when `poll_step` is zero or longer than one second, or when
    /// `refresh_interval` is zero.
    pub fn validate(self) -> ReflexResult<Self> {
        if self.poll_step.is_zero() || self.poll_step > Duration::from_secs(1) {
            return Err(ValidationError::InvalidConfig {
                field: "poll_step".to_string(),
                reason: "must be within (0, 1s]".to_string(),
            }
            .into());
        }
        if self.refresh_interval.is_zero() {
            return Err(ValidationError::InvalidConfig {
                field: "refresh_interval".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        Ok(self)
    }
}

struct Shared {
    store: Arc<dyn TriggerStore>,
    current: RwLock<Arc<TriggerSnapshot>>,
    // Serializes refreshes so generations are published in order.
    refresh_lock: Mutex<u64>,
    listeners: ListenerSet,
}

impl Shared {
    fn refresh(&self) -> Option<Arc<TriggerSnapshot>> {
        let snapshot = {
            let Ok(mut generation) = self.refresh_lock.lock() else {
                tracing::warn!("trigger refresh lock poisoned");
                return None;
            };

            let rows = match self.store.list_triggers() {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, "trigger refresh failed; keeping previous snapshot");
                    return None;
                }
            };

            let mut triggers = Vec::with_capacity(rows.len());
            let mut skipped = 0usize;
            for row in &rows {
                match TriggerRecord::compile(row) {
                    Ok(record) => triggers.push(Arc::new(record)),
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(trigger_id = %row.id, pattern = %row.pattern, error = %e, "skipping trigger");
                    }
                }
            }

            *generation += 1;
            let snapshot = Arc::new(TriggerSnapshot::from_parts(*generation, &rows, triggers, skipped));

            match self.current.write() {
                Ok(mut current) => *current = Arc::clone(&snapshot),
                Err(_) => {
                    tracing::warn!("trigger snapshot lock poisoned");
                    return None;
                }
            }

            tracing::debug!(
                generation = snapshot.generation(),
                triggers = snapshot.len(),
                skipped,
                fingerprint = %snapshot.fingerprint(),
                "trigger snapshot published"
            );
            snapshot
        };

        // No cache lock is held while listeners run.
        self.listeners.notify(&snapshot);
        Some(snapshot)
    }

    fn current(&self) -> Arc<TriggerSnapshot> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

/// In-memory, atomically swapped view of the trigger table.
pub struct TriggerCache {
    shared: Arc<Shared>,
    config: TriggerCacheConfig,
    auto_refresh: Mutex<Option<BackgroundTask>>,
}

impl TriggerCache {
    /// Create a cache over `store` with default settings.
    ///
    /// The cache starts empty; call [`refresh`](Self::refresh) or
    /// [`start_auto_refresh`](Self::start_auto_refresh) to load it.
    #[must_use]
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        Self::with_config(store, TriggerCacheConfig::default())
    }

    /// Create a cache with explicit settings.
    #[must_use]
    pub fn with_config(store: Arc<dyn TriggerStore>, config: TriggerCacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                current: RwLock::new(Arc::new(TriggerSnapshot::empty())),
                refresh_lock: Mutex::new(0),
                listeners: ListenerSet::default(),
            }),
            config,
            auto_refresh: Mutex::new(None),
        }
    }

    /// The cache settings.
    #[must_use]
    pub const fn config(&self) -> &TriggerCacheConfig {
        &self.config
    }

    /// The store this cache reads from.
    #[must_use]
    pub fn store(&self) -> Arc<dyn TriggerStore> {
        Arc::clone(&self.shared.store)
    }

    /// Reload from the store and publish a new snapshot.
    ///
    /// Returns the published snapshot, or `None` when the store read failed
    /// and the previous snapshot stays current.
    pub fn refresh(&self) -> Option<Arc<TriggerSnapshot>> {
        self.shared.refresh()
    }

    /// The current snapshot. Never touches the store.
    #[must_use]
    pub fn list(&self) -> Arc<TriggerSnapshot> {
        self.shared.current()
    }

    /// Refresh right after an admin write.
    pub fn notify_change(&self) -> Option<Arc<TriggerSnapshot>> {
        self.refresh()
    }

    /// Subscribe to published snapshots.
    pub fn register_listener(&self, listener: Arc<dyn SnapshotListener>) -> ListenerId {
        self.shared.listeners.register(listener)
    }

    /// Remove a subscription. Returns whether it was registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unregister(id)
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Start the background refresh loop.
    ///
    /// The loop refreshes immediately when `liveness` reports live (or is
    /// absent), then every `interval` while it stays live. While not live it
    /// idles without touching the store. Returns `Ok(false)` when a loop is
    /// already running.
    ///
    /// # Errors
    ///
    /// Fails when `interval` is zero or the thread cannot be spawned.
    pub fn start_auto_refresh(
        &self,
        liveness: Option<Arc<dyn LivenessProbe>>,
        interval: Duration,
    ) -> ReflexResult<bool> {
        if interval.is_zero() {
            return Err(ValidationError::InvalidConfig {
                field: "refresh_interval".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        let mut slot = self
            .auto_refresh
            .lock()
            .map_err(|_| ReflexError::internal("auto-refresh lock poisoned"))?;
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return Ok(false);
            }
        }

        let shared = Arc::clone(&self.shared);
        let poll_step = self.config.poll_step.min(Duration::from_secs(1));
        let task = BackgroundTask::spawn("trigger-refresh", move |stop| {
            auto_refresh_loop(&shared, liveness.as_deref(), interval, poll_step, &stop);
        })?;
        tracing::info!(interval_secs = interval.as_secs_f64(), "trigger auto-refresh started");
        *slot = Some(task);
        Ok(true)
    }

    /// Start the background loop with the configured interval.
    ///
    /// # Errors
    ///
    /// See [`start_auto_refresh`](Self::start_auto_refresh).
    pub fn start_auto_refresh_default(&self, liveness: Option<Arc<dyn LivenessProbe>>) -> ReflexResult<bool> {
        self.start_auto_refresh(liveness, self.config.refresh_interval)
    }

    /// Whether the background loop is running.
    #[must_use]
    pub fn is_auto_refreshing(&self) -> bool {
        self.auto_refresh
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the background loop, waiting up to the configured join timeout.
    ///
    /// Returns false if the loop did not exit in time; it is then detached.
    pub fn stop_auto_refresh(&self) -> bool {
        let task = match self.auto_refresh.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match task {
            Some(task) => {
                let stopped = task.stop(self.config.join_timeout);
                tracing::info!(stopped, "trigger auto-refresh stopped");
                stopped
            }
            None => true,
        }
    }
}

impl Drop for TriggerCache {
    fn drop(&mut self) {
        self.stop_auto_refresh();
    }
}

impl std::fmt::Debug for TriggerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.shared.current();
        f.debug_struct("TriggerCache")
            .field("generation", &current.generation())
            .field("triggers", &current.len())
            .field("listeners", &self.shared.listeners.len())
            .finish_non_exhaustive()
    }
}

fn auto_refresh_loop(
    shared: &Shared,
    liveness: Option<&dyn LivenessProbe>,
    interval: Duration,
    poll_step: Duration,
    stop: &StopSignal,
) {
    // Due immediately on start.
    let mut next_due = Instant::now();
    loop {
        if stop.is_stopped() {
            return;
        }

        let live = liveness.map_or(true, |probe| probe.is_live());
        let now = Instant::now();
        if live && now >= next_due {
            shared.refresh();
            next_due = Instant::now() + interval;
        }

        let wait = if live {
            next_due.saturating_duration_since(Instant::now()).min(poll_step)
        } else {
            poll_step
        };
        if stop.wait(wait.max(Duration::from_millis(1))) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTriggerStore;
    use crate::trigger::{NewTrigger, TriggerId};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn store_with(patterns: &[&str]) -> Arc<InMemoryTriggerStore> {
        let store = Arc::new(InMemoryTriggerStore::new());
        for p in patterns {
            store
                .insert_trigger(NewTrigger::reply(*p, "r").into_row(TriggerId::new()))
                .unwrap();
        }
        store
    }

    #[test]
    fn list_before_refresh_is_empty() {
        let cache = TriggerCache::new(store_with(&["a"]));
        assert!(cache.list().is_empty());
        assert_eq!(cache.list().generation(), 0);
    }

    #[test]
    fn refresh_publishes_and_bumps_generation() {
        let cache = TriggerCache::new(store_with(&["a", "b"]));
        let first = cache.refresh().unwrap();
        assert_eq!(first.len(), 2);
        let second = cache.refresh().unwrap();
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn store_error_keeps_previous_snapshot() {
        let store = store_with(&["a"]);
        let cache = TriggerCache::new(store.clone());
        cache.refresh().unwrap();
        store.fail_next(1);
        assert!(cache.refresh().is_none());
        assert_eq!(cache.list().len(), 1);
        assert_eq!(cache.list().generation(), 1);
    }

    #[test]
    fn listeners_see_new_snapshot() {
        let cache = TriggerCache::new(store_with(&["a"]));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let id = cache.register_listener(Arc::new(move |snap: &Arc<TriggerSnapshot>| -> Result<(), ListenerError> {
            s.store(snap.len(), Ordering::SeqCst);
            Ok(())
        }));
        cache.notify_change();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(cache.unregister_listener(id));
        assert_eq!(cache.listener_count(), 0);
    }

    #[test]
    fn auto_refresh_waits_for_liveness() {
        let store = store_with(&["a"]);
        let cache = TriggerCache::with_config(
            store,
            TriggerCacheConfig {
                poll_step: Duration::from_millis(10),
                ..TriggerCacheConfig::default()
            },
        );
        let live = Arc::new(AtomicBool::new(false));
        let l = Arc::clone(&live);
        let probe: Arc<dyn LivenessProbe> = Arc::new(move || l.load(Ordering::SeqCst));

        assert!(cache.start_auto_refresh(Some(probe), Duration::from_secs(3600)).unwrap());
        assert!(!cache.start_auto_refresh(None, Duration::from_secs(3600)).unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.list().generation(), 0);

        live.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while cache.list().generation() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(cache.list().generation(), 1);
        assert!(cache.stop_auto_refresh());
        assert!(!cache.is_auto_refreshing());
    }

    #[test]
    fn config_rejects_long_poll_step() {
        let cfg = TriggerCacheConfig {
            poll_step: Duration::from_secs(2),
            ..TriggerCacheConfig::default()
        };
        assert!(cfg.validate().unwrap_err().is_validation());
        assert!(TriggerCacheConfig::default().validate().is_ok());
    }
}
