//! Background execution primitives.
//!
//! Two shapes cover every background unit in the crate:
//! - [`WorkerPool`]: a small, bounded, thread-based pool that runs submitted
//!   jobs off the caller's path (message matching, cooldown persistence).
//! - [`BackgroundTask`]: one named thread with a cooperative stop signal and a
//!   bounded-timeout join (cache auto-refresh, schedule timers, telemetry).
//!
//! Jobs and task bodies run under `catch_unwind`; a panic is logged and the
//! unit carries on (pool) or exits cleanly (task).

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{ExecutionError, ReflexError, ReflexResult};

/// A unit of work for a [`WorkerPool`].
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fixed-size pool of named worker threads fed by a bounded queue.
pub(crate) struct WorkerPool {
    name: &'static str,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    pub(crate) fn start(name: &'static str, workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("chatreflex-{name}-{idx}"))
                .spawn(move || {
                    // Exits once every sender is gone and the queue is drained.
                    while let Ok(job) = rx.recv() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            tracing::warn!(pool = name, panic = %panic_message(payload.as_ref()), "job panicked");
                        }
                    }
                })
                .expect("failed to spawn chatreflex worker");
            handles.push(handle);
        }

        Self {
            name,
            tx: Some(tx),
            workers: handles,
            queue_capacity,
        }
    }

    /// Non-blocking submit.
    pub(crate) fn try_submit(&self, job: Job) -> ReflexResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(ReflexError::Execution(ExecutionError::Disconnected {
                path: self.name.to_string(),
            }));
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReflexError::Execution(ExecutionError::QueueFull {
                path: self.name.to_string(),
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(ReflexError::Execution(ExecutionError::Disconnected {
                path: self.name.to_string(),
            })),
        }
    }

    /// Close the queue; workers drain queued jobs and exit.
    pub(crate) fn shutdown(&mut self) {
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cooperative stop signal handed to a [`BackgroundTask`] body.
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    /// Whether stop was requested.
    pub(crate) fn is_stopped(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep up to `timeout`, waking early on stop. Returns true if stopped.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Channel that becomes ready on stop, for use in `select!`.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// One named background thread with signal-then-join shutdown.
pub(crate) struct BackgroundTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F>(name: impl Into<String>, body: F) -> ReflexResult<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("chatreflex-{name}"))
            .spawn(move || {
                // `done_tx` is dropped on exit, including unwinding.
                let _done = done_tx;
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(StopSignal { rx: stop_rx }))) {
                    tracing::warn!(task = %thread_name, panic = %panic_message(payload.as_ref()), "background task panicked");
                }
            })
            .map_err(|e| ReflexError::internal(format!("failed to spawn {name}: {e}")))?;

        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    /// Request stop without waiting.
    pub(crate) fn signal_stop(&mut self) {
        drop(self.stop_tx.take());
    }

    /// Whether the body has returned.
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.done_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Signal stop and wait up to `timeout` for the thread to exit.
    ///
    /// Returns false if the thread was still running at the deadline; it is
    /// then detached and may keep running until it next observes the signal.
    pub(crate) fn stop(mut self, timeout: Duration) -> bool {
        self.signal_stop();
        match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(task = %self.name, timeout_ms = timeout.as_millis() as u64, "background task did not stop in time; detaching");
                drop(self.handle.take());
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        // Never join on drop: signal and detach.
        self.signal_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn pool_runs_jobs_and_survives_panics() {
        let mut pool = WorkerPool::start("test", 1, 8);
        let count = Arc::new(AtomicUsize::new(0));

        pool.try_submit(Box::new(|| panic!("boom"))).unwrap();
        for _ in 0..3 {
            let count = Arc::clone(&count);
            pool.try_submit(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pool_reports_full_queue() {
        let pool = WorkerPool::start("full", 1, 1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        pool.try_submit(Box::new(move || {
            let _ = gate_rx.recv();
        }))
        .unwrap();

        // One job is running, fill the single queue slot, then overflow.
        let mut saw_full = false;
        for _ in 0..3 {
            if let Err(ReflexError::Execution(ExecutionError::QueueFull { capacity, .. })) =
                pool.try_submit(Box::new(|| {}))
            {
                assert_eq!(capacity, 1);
                saw_full = true;
            }
        }
        assert!(saw_full);
        drop(gate_tx);
    }

    #[test]
    fn task_stops_promptly() {
        let task = BackgroundTask::spawn("sleeper", |stop| {
            while !stop.wait(Duration::from_secs(30)) {}
        })
        .unwrap();

        let started = Instant::now();
        assert!(task.stop(Duration::from_secs(2)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn task_join_times_out_on_stuck_body() {
        let (release_tx, release_rx) = bounded::<()>(0);
        let task = BackgroundTask::spawn("stuck", move |_stop| {
            let _ = release_rx.recv();
        })
        .unwrap();

        assert!(!task.stop(Duration::from_millis(50)));
        drop(release_tx);
    }

    #[test]
    fn task_reports_finished() {
        let task = BackgroundTask::spawn("quick", |_stop| {}).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !task.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(task.is_finished());
    }
}
