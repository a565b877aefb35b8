//! Telemetry batcher worker.
//!
//! Producers enqueue events with a non-blocking `try_send` and never see a
//! sink error. One background worker buffers events and writes them in a
//! single `insert_batch` call once the buffer reaches `batch_size` or its
//! oldest event is `batch_time` old. A failed write drops the buffer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde_json::{Map, Value};

use crate::error::{ReflexResult, ValidationError};
use crate::liveness::LivenessProbe;
use crate::runtime::{BackgroundTask, StopSignal};
use crate::storage::TelemetrySink;

use super::event::TelemetryEvent;

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Flush once this many events are buffered.
    pub batch_size: usize,
    /// Flush once the oldest buffered event is this old.
    pub batch_time: Duration,
    /// Max queued events before `log` starts dropping.
    pub queue_capacity: usize,
    /// Upper bound on one worker wait, keeping it responsive to stop.
    pub max_wait: Duration,
    /// How long `close` keeps flushing while the session is not live.
    pub grace_period: Duration,
    /// How often `close` re-checks liveness during the grace period.
    pub poll_interval: Duration,
    /// How long `close` waits for the worker to exit.
    pub join_timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_time: Duration::from_secs(15 * 60),
            queue_capacity: 10_000,
            max_wait: Duration::from_secs(1),
            grace_period: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(60),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl TelemetryConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails when a size, capacity or wait bound is zero.
    pub fn validate(self) -> ReflexResult<Self> {
        let invalid = |field: &str, reason: &str| -> ReflexResult<Self> {
            Err(ValidationError::InvalidConfig {
                field: field.to_string(),
                reason: reason.to_string(),
            }
            .into())
        };
        if self.batch_size == 0 {
            return invalid("batch_size", "must be greater than zero");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity", "must be greater than zero");
        }
        if self.batch_time.is_zero() {
            return invalid("batch_time", "must be positive");
        }
        if self.max_wait.is_zero() {
            return invalid("max_wait", "must be positive");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval", "must be positive");
        }
        Ok(self)
    }
}

/// Per-call overrides for [`TelemetryBatcher::close`].
#[derive(Clone, Default)]
pub struct CloseOptions {
    /// Worker join timeout; defaults to `join_timeout`.
    pub timeout: Option<Duration>,
    /// Liveness probe; defaults to the one given at construction.
    pub liveness: Option<Arc<dyn LivenessProbe>>,
    /// Grace period; defaults to `grace_period`.
    pub grace_period: Option<Duration>,
    /// Liveness poll interval; defaults to `poll_interval`.
    pub poll_interval: Option<Duration>,
}

impl CloseOptions {
    /// Override the join timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the liveness probe.
    #[must_use]
    pub fn liveness(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.liveness = Some(probe);
        self
    }

    /// Override the grace period.
    #[must_use]
    pub const fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Override the poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

impl std::fmt::Debug for CloseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseOptions")
            .field("timeout", &self.timeout)
            .field("liveness", &self.liveness.is_some())
            .field("grace_period", &self.grace_period)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Counters {
    dropped: AtomicU64,
    flushed_batches: AtomicU64,
    failed_flushes: AtomicU64,
}

/// Non-blocking, batching front end for a [`TelemetrySink`].
///
/// Without a sink the batcher is disabled: no worker is started and every
/// `log*` call is a no-op.
pub struct TelemetryBatcher {
    config: TelemetryConfig,
    tx: Option<Sender<TelemetryEvent>>,
    liveness: Option<Arc<dyn LivenessProbe>>,
    worker: Mutex<Option<BackgroundTask>>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl TelemetryBatcher {
    /// Start a batcher.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration or when the worker cannot start.
    pub fn new(
        sink: Option<Arc<dyn TelemetrySink>>,
        config: TelemetryConfig,
        liveness: Option<Arc<dyn LivenessProbe>>,
    ) -> ReflexResult<Self> {
        let config = config.validate()?;
        let counters = Arc::new(Counters::default());

        let Some(sink) = sink else {
            tracing::info!("no telemetry sink configured; telemetry disabled");
            return Ok(Self {
                config,
                tx: None,
                liveness,
                worker: Mutex::new(None),
                closed: AtomicBool::new(false),
                counters,
            });
        };

        let (tx, rx) = bounded::<TelemetryEvent>(config.queue_capacity);
        let worker_cfg = config.clone();
        let worker_counters = Arc::clone(&counters);
        let task = BackgroundTask::spawn("telemetry", move |stop| {
            worker_loop(sink.as_ref(), &rx, &worker_cfg, &worker_counters, &stop);
        })?;

        Ok(Self {
            config,
            tx: Some(tx),
            liveness,
            worker: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
            counters,
        })
    }

    /// A batcher that ignores every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: TelemetryConfig::default(),
            tx: None,
            liveness: None,
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Whether a sink is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue an event. Never blocks; a full queue drops the event.
    pub fn log(&self, event: TelemetryEvent) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record an inbound chat message.
    pub fn log_chat(&self, channel: &str, user: &str, fired: bool, name: Option<String>, details: Map<String, Value>) {
        if self.is_enabled() {
            self.log(TelemetryEvent::chat(channel, user, fired, name, details));
        }
    }

    /// Record a moderation action.
    pub fn log_mod_action(&self, channel: &str, target_user: &str, action: &str, details: Map<String, Value>) {
        if self.is_enabled() {
            self.log(TelemetryEvent::mod_action(channel, target_user, action, details));
        }
    }

    /// Record a trigger fire.
    pub fn log_trigger_event(&self, channel: &str, trigger_name: &str, trigger_type: &str, details: Map<String, Value>) {
        if self.is_enabled() {
            self.log(TelemetryEvent::trigger(channel, trigger_name, trigger_type, details));
        }
    }

    /// Events dropped because the queue was full or the batcher closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Successful `insert_batch` calls.
    #[must_use]
    pub fn flushed_batches(&self) -> u64 {
        self.counters.flushed_batches.load(Ordering::Relaxed)
    }

    /// Failed `insert_batch` calls; their rows were discarded.
    #[must_use]
    pub fn failed_flushes(&self) -> u64 {
        self.counters.failed_flushes.load(Ordering::Relaxed)
    }

    /// Stop the worker with the configured defaults.
    pub fn close(&self) -> bool {
        self.close_with(CloseOptions::default())
    }

    /// Stop the worker, draining and flushing what is queued.
    ///
    /// With no liveness probe, or one that reports live, the worker stops at
    /// once. While the probe reports not live, the worker keeps running for
    /// up to the grace period, re-checking every poll interval, and stops as
    /// soon as the probe flips live.
    ///
    /// Returns false if the worker did not exit within the join timeout.
    pub fn close_with(&self, options: CloseOptions) -> bool {
        let task = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(task) = task else {
            return true;
        };

        let probe = options.liveness.or_else(|| self.liveness.clone());
        if let Some(probe) = probe {
            // A panicking probe on the first check means stop now.
            if probe_live(probe.as_ref()) == Some(false) {
                let grace = options.grace_period.unwrap_or(self.config.grace_period);
                let poll = options.poll_interval.unwrap_or(self.config.poll_interval);
                tracing::info!(grace_secs = grace.as_secs_f64(), "session not live; extending telemetry shutdown");
                wait_for_live(probe.as_ref(), grace, poll);
            }
        }

        self.closed.store(true, Ordering::Release);
        let stopped = task.stop(options.timeout.unwrap_or(self.config.join_timeout));
        tracing::info!(
            stopped,
            batches = self.flushed_batches(),
            failed = self.failed_flushes(),
            dropped = self.dropped(),
            "telemetry batcher closed"
        );
        stopped
    }
}

impl std::fmt::Debug for TelemetryBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBatcher")
            .field("enabled", &self.is_enabled())
            .field("config", &self.config)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

fn probe_live(probe: &dyn LivenessProbe) -> Option<bool> {
    panic::catch_unwind(AssertUnwindSafe(|| probe.is_live())).ok()
}

fn wait_for_live(probe: &dyn LivenessProbe, grace: Duration, poll: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        let now = Instant::now();
        if now >= deadline {
            tracing::debug!("telemetry grace period elapsed");
            return;
        }
        thread::sleep(poll.min(deadline - now));
        if probe_live(probe) == Some(true) {
            tracing::debug!("session live again; stopping telemetry");
            return;
        }
    }
}

fn flush(sink: &dyn TelemetrySink, buf: &mut Vec<TelemetryEvent>, counters: &Counters) {
    if buf.is_empty() {
        return;
    }
    let rows = buf.len();
    match panic::catch_unwind(AssertUnwindSafe(|| sink.insert_batch(buf))) {
        Ok(Ok(())) => {
            counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(rows, "telemetry batch flushed");
        }
        Ok(Err(e)) => {
            counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(rows, error = %e, "telemetry flush failed; dropping batch");
        }
        Err(_) => {
            counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(rows, "telemetry sink panicked; dropping batch");
        }
    }
    buf.clear();
}

fn worker_loop(
    sink: &dyn TelemetrySink,
    rx: &Receiver<TelemetryEvent>,
    cfg: &TelemetryConfig,
    counters: &Counters,
    stop: &StopSignal,
) {
    let mut buf: Vec<TelemetryEvent> = Vec::with_capacity(cfg.batch_size);
    let mut oldest: Option<Instant> = None;

    loop {
        let timeout = match oldest {
            None => cfg.max_wait,
            Some(t) => cfg.batch_time.saturating_sub(t.elapsed()).min(cfg.max_wait),
        };

        select! {
            recv(stop.receiver()) -> _ => break,
            recv(rx) -> msg => {
                match msg {
                    Ok(event) => {
                        if buf.is_empty() {
                            oldest = Some(Instant::now());
                        }
                        buf.push(event);
                        if buf.len() >= cfg.batch_size {
                            flush(sink, &mut buf, counters);
                            oldest = None;
                        }
                    }
                    Err(_) => break,
                }
            }
            default(timeout) => {}
        }

        if oldest.is_some_and(|t| t.elapsed() >= cfg.batch_time) {
            flush(sink, &mut buf, counters);
            oldest = None;
        }
    }

    // Drain what producers managed to enqueue before stop.
    while let Ok(event) = rx.try_recv() {
        buf.push(event);
        if buf.len() >= cfg.batch_size {
            flush(sink, &mut buf, counters);
        }
    }
    flush(sink, &mut buf, counters);
}
