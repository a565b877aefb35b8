//! Interval scheduler for persisted broadcasts.
//!
//! Every running schedule owns one background task that sleeps for its
//! interval, sends the message, then re-reads the `enabled` flag from the
//! store. An external write that disables or deletes the row therefore takes
//! effect within one period. A disabled loop exits; `start` picks the
//! schedule up again once it is re-enabled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{ReflexError, ReflexResult, ValidationError};
use crate::matching::{send_reply, ReplySink};
use crate::runtime::{BackgroundTask, StopSignal};
use crate::schedule::{ScheduleId, ScheduleRecord, ScheduleState};
use crate::storage::ScheduleStore;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Length of one schedule minute.
    pub minute: Duration,
    /// How long cancelling a timer waits for its thread.
    pub join_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            minute: Duration::from_secs(60),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails when `minute` is zero.
    pub fn validate(self) -> ReflexResult<Self> {
        if self.minute.is_zero() {
            return Err(ValidationError::InvalidConfig {
                field: "minute".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        Ok(self)
    }
}

#[derive(Default)]
struct SchedulerState {
    // Store order.
    schedules: Vec<ScheduleRecord>,
    running: HashMap<ScheduleId, BackgroundTask>,
    stopped: HashSet<ScheduleId>,
}

impl SchedulerState {
    fn prune_finished(&mut self) {
        let finished: Vec<ScheduleId> = self
            .running
            .iter()
            .filter(|(_, task)| task.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.running.remove(&id);
            self.stopped.insert(id);
        }
    }
}

/// Runs persisted schedules on independent timers.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    send: Arc<dyn ReplySink>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// Create a scheduler with default timing.
    #[must_use]
    pub fn new(store: Arc<dyn ScheduleStore>, send: Arc<dyn ReplySink>) -> Self {
        Self {
            store,
            send,
            config: SchedulerConfig::default(),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Create a scheduler with explicit timing.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration.
    pub fn with_config(
        store: Arc<dyn ScheduleStore>,
        send: Arc<dyn ReplySink>,
        config: SchedulerConfig,
    ) -> ReflexResult<Self> {
        Ok(Self {
            store,
            send,
            config: config.validate()?,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    fn lock(&self) -> ReflexResult<MutexGuard<'_, SchedulerState>> {
        self.state
            .lock()
            .map_err(|_| ReflexError::internal("scheduler state lock poisoned"))
    }

    /// Replace the in-memory schedules with the store contents.
    ///
    /// Running timers are left alone.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be read.
    pub fn load(&self) -> ReflexResult<usize> {
        let rows = self.store.list_schedules()?;
        let count = rows.len();
        let mut state = self.lock()?;
        state.schedules = rows;
        tracing::debug!(schedules = count, "schedules loaded");
        Ok(count)
    }

    /// Persist a new schedule. Does not start its timer.
    ///
    /// # Errors
    ///
    /// Rejects an empty message or a non-positive interval, and fails when
    /// the store rejects the write.
    pub fn add(&self, message: impl Into<String>, interval_minutes: i64, enabled: bool) -> ReflexResult<ScheduleId> {
        let message = message.into();
        if message.is_empty() {
            return Err(ValidationError::MissingField {
                field: "message".to_string(),
            }
            .into());
        }
        let interval = u32::try_from(interval_minutes)
            .ok()
            .filter(|m| *m > 0)
            .ok_or(ValidationError::NonPositiveInterval {
                minutes: interval_minutes,
            })?;

        let record = ScheduleRecord {
            id: ScheduleId::new(),
            message,
            interval_minutes: interval,
            enabled,
        };
        let id = self.store.insert_schedule(record.clone())?;
        self.lock()?.schedules.push(record);
        tracing::info!(schedule_id = %id, interval_minutes = interval, enabled, "schedule added");
        Ok(id)
    }

    /// Delete a schedule and cancel its timer.
    ///
    /// Returns whether the store held the row.
    ///
    /// # Errors
    ///
    /// Fails when the store rejects the delete.
    pub fn remove(&self, id: ScheduleId) -> ReflexResult<bool> {
        let removed = self.store.delete_schedule(id)?;
        let task = {
            let mut state = self.lock()?;
            state.schedules.retain(|s| s.id != id);
            state.stopped.insert(id);
            state.running.remove(&id)
        };
        if let Some(task) = task {
            task.stop(self.config.join_timeout);
        }
        tracing::info!(schedule_id = %id, removed, "schedule removed");
        Ok(removed)
    }

    /// Flip a schedule's `enabled` flag in the store.
    ///
    /// A running loop observes the change after its current sleep.
    ///
    /// # Errors
    ///
    /// Fails when the store rejects the write.
    pub fn set_enabled(&self, id: ScheduleId, enabled: bool) -> ReflexResult<bool> {
        let found = self.store.set_schedule_enabled(id, enabled)?;
        if found {
            let mut state = self.lock()?;
            if let Some(s) = state.schedules.iter_mut().find(|s| s.id == id) {
                s.enabled = enabled;
            }
        }
        Ok(found)
    }

    /// Reload from the store and start a timer for every enabled schedule
    /// that has none. Returns how many timers were started.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be read or a thread cannot be spawned.
    pub fn start(&self) -> ReflexResult<usize> {
        self.load()?;
        let mut state = self.lock()?;
        state.prune_finished();

        let pending: Vec<ScheduleRecord> = state
            .schedules
            .iter()
            .filter(|s| s.enabled && !state.running.contains_key(&s.id))
            .cloned()
            .collect();

        let mut started = 0;
        for record in pending {
            let id = record.id;
            let store = Arc::clone(&self.store);
            let send = Arc::clone(&self.send);
            let minute = self.config.minute;
            let task = BackgroundTask::spawn(format!("schedule-{id}"), move |stop| {
                schedule_loop(&record, store.as_ref(), send.as_ref(), minute, &stop);
            })?;
            state.running.insert(id, task);
            state.stopped.remove(&id);
            started += 1;
        }

        tracing::info!(started, running = state.running.len(), "scheduler started");
        Ok(started)
    }

    /// Cancel every running timer. Persisted state is untouched.
    pub fn stop(&self) {
        let tasks: Vec<(ScheduleId, BackgroundTask)> = match self.state.lock() {
            Ok(mut state) => {
                let tasks: Vec<_> = state.running.drain().collect();
                for (id, _) in &tasks {
                    state.stopped.insert(*id);
                }
                tasks
            }
            Err(_) => return,
        };

        let mut tasks = tasks;
        for (_, task) in &mut tasks {
            task.signal_stop();
        }
        let count = tasks.len();
        for (_, task) in tasks {
            task.stop(self.config.join_timeout);
        }
        if count > 0 {
            tracing::info!(stopped = count, "scheduler stopped");
        }
    }

    /// In-memory schedules, in store order.
    #[must_use]
    pub fn list(&self) -> Vec<ScheduleRecord> {
        self.state.lock().map(|s| s.schedules.clone()).unwrap_or_default()
    }

    /// Lifecycle state of a schedule known to this scheduler.
    #[must_use]
    pub fn state(&self, id: ScheduleId) -> Option<ScheduleState> {
        let mut state = self.state.lock().ok()?;
        state.prune_finished();
        if state.running.contains_key(&id) {
            Some(ScheduleState::Running)
        } else if state.stopped.contains(&id) {
            Some(ScheduleState::Stopped)
        } else if state.schedules.iter().any(|s| s.id == id) {
            Some(ScheduleState::Pending)
        } else {
            None
        }
    }

    /// Ids with a live timer.
    #[must_use]
    pub fn running(&self) -> Vec<ScheduleId> {
        match self.state.lock() {
            Ok(mut state) => {
                state.prune_finished();
                state.running.keys().copied().collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("schedules", &self.list().len())
            .finish_non_exhaustive()
    }
}

fn schedule_loop(
    record: &ScheduleRecord,
    store: &dyn ScheduleStore,
    send: &dyn ReplySink,
    minute: Duration,
    stop: &StopSignal,
) {
    let period = minute.checked_mul(record.interval_minutes).unwrap_or(Duration::MAX);
    let mut enabled = record.enabled;

    while enabled {
        if stop.wait(period) {
            return;
        }

        if let Err(e) = send_reply(send, &record.message) {
            tracing::warn!(schedule_id = %record.id, error = %e, "scheduled send failed");
        }

        match store.read_schedule_enabled(record.id) {
            Ok(Some(flag)) => enabled = flag,
            Ok(None) => {
                tracing::debug!(schedule_id = %record.id, "schedule row gone; stopping timer");
                return;
            }
            Err(e) => {
                tracing::warn!(schedule_id = %record.id, error = %e, "failed to read schedule state");
            }
        }
    }
    tracing::debug!(schedule_id = %record.id, "schedule disabled; stopping timer");
}
