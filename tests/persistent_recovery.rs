//! Recovery tests for the persistent store.
//!
//! These tests verify that:
//! - schedules and triggers survive a restart
//! - a torn final log entry is dropped on replay
//! - a restarted scheduler picks persisted schedules back up

#![cfg(feature = "persistent")]

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use chatreflex::storage::open_store;
use chatreflex::{
    DeliveryError, NewTrigger, ReplySink, ScheduleStore, Scheduler, SchedulerConfig, TriggerCache, TriggerId,
    TriggerStore,
};

#[test]
fn torn_tail_entry_is_dropped() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("chatreflex.wal");

    {
        let stores = open_store(dir.path(), None).unwrap();
        for n in 0..5 {
            stores
                .insert_trigger(NewTrigger::reply(format!("p{n}"), "r").into_row(TriggerId::new()))
                .unwrap();
        }
    }

    {
        let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size - 3).unwrap();
    }

    let stores = open_store(dir.path(), None).unwrap();
    let rows = stores.list_triggers().unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].pattern, "p3");

    // Appends after recovery land after the last valid entry.
    stores
        .insert_trigger(NewTrigger::reply("after", "r").into_row(TriggerId::new()))
        .unwrap();
    drop(stores);
    let stores = open_store(dir.path(), None).unwrap();
    assert_eq!(stores.list_triggers().unwrap().len(), 5);
}

#[test]
fn fire_times_survive_restart() {
    let dir = tempdir().unwrap();
    let id;
    {
        let stores = open_store(dir.path(), None).unwrap();
        id = stores
            .insert_trigger(NewTrigger::reply("x", "y").with_cooldown(5).into_row(TriggerId::new()))
            .unwrap();
        stores.update_last_fired(id, 1234.5).unwrap();
    }

    let stores = Arc::new(open_store(dir.path(), None).unwrap());
    let cache = TriggerCache::new(stores);
    let snap = cache.refresh().unwrap();
    assert_eq!(snap.get(id).unwrap().last_fired_at, 1234.5);
}

#[test]
fn scheduler_resumes_after_restart() {
    let dir = tempdir().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let send: Arc<dyn ReplySink> = Arc::new(move |_m: &str| -> Result<(), DeliveryError> {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let fast = SchedulerConfig {
        minute: Duration::from_millis(20),
        ..SchedulerConfig::default()
    };

    let (enabled, disabled) = {
        let stores = Arc::new(open_store(dir.path(), None).unwrap());
        let sched = Scheduler::with_config(stores.clone(), Arc::clone(&send), fast.clone()).unwrap();
        let enabled = sched.add("on", 1, true).unwrap();
        let disabled = sched.add("off", 1, true).unwrap();
        assert!(stores.set_schedule_enabled(disabled, false).unwrap());
        (enabled, disabled)
    };

    let stores = Arc::new(open_store(dir.path(), None).unwrap());
    assert_eq!(stores.read_schedule_enabled(enabled).unwrap(), Some(true));
    assert_eq!(stores.read_schedule_enabled(disabled).unwrap(), Some(false));

    let sched = Scheduler::with_config(stores, send, fast).unwrap();
    assert_eq!(sched.start().unwrap(), 1);
    assert_eq!(sched.running(), vec![enabled]);

    let deadline = Instant::now() + Duration::from_secs(2);
    while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(count.load(Ordering::SeqCst) >= 1);
    sched.stop();
}
