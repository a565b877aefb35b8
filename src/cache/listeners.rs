//! Snapshot listener fan-out.
//!
//! Listeners are held in an explicit ordered list and invoked one by one;
//! an error or panic in one listener is logged and does not reach the others.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::snapshot::TriggerSnapshot;

/// Failure reported by a listener.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Receives every newly published snapshot.
pub trait SnapshotListener: Send + Sync {
    /// Called after the snapshot has been published.
    fn on_snapshot(&self, snapshot: &Arc<TriggerSnapshot>) -> Result<(), ListenerError>;
}

impl<F> SnapshotListener for F
where
    F: Fn(&Arc<TriggerSnapshot>) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_snapshot(&self, snapshot: &Arc<TriggerSnapshot>) -> Result<(), ListenerError> {
        self(snapshot)
    }
}

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Arc<dyn SnapshotListener>)>>,
}

impl ListenerSet {
    pub(crate) fn register(&self, listener: Arc<dyn SnapshotListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((id, listener));
        }
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(lid, _)| *lid != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Invoke every listener in registration order. The list is copied first
    /// so listeners may (un)register without deadlocking.
    pub(crate) fn notify(&self, snapshot: &Arc<TriggerSnapshot>) {
        let listeners: Vec<_> = match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(_) => return,
        };

        for (id, listener) in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_snapshot(snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = id.0, generation = snapshot.generation(), error = %e, "snapshot listener failed");
                }
                Err(_) => {
                    tracing::warn!(listener = id.0, generation = snapshot.generation(), "snapshot listener panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn failing_listener_does_not_block_others() {
        let set = ListenerSet::default();
        let hits = Arc::new(AtomicUsize::new(0));

        set.register(Arc::new(|_: &Arc<TriggerSnapshot>| -> Result<(), ListenerError> { Err(ListenerError("nope".to_string())) }));
        set.register(Arc::new(|_: &Arc<TriggerSnapshot>| -> Result<(), ListenerError> { panic!("bad listener") }));
        let h = Arc::clone(&hits);
        set.register(Arc::new(move |_: &Arc<TriggerSnapshot>| -> Result<(), ListenerError> {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        set.notify(&Arc::new(TriggerSnapshot::empty()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_removes_only_that_listener() {
        let set = ListenerSet::default();
        let a = set.register(Arc::new(|_: &Arc<TriggerSnapshot>| -> Result<(), ListenerError> { Ok(()) }));
        let _b = set.register(Arc::new(|_: &Arc<TriggerSnapshot>| -> Result<(), ListenerError> { Ok(()) }));
        assert!(set.unregister(a));
        assert!(!set.unregister(a));
        assert_eq!(set.len(), 1);
    }
}
