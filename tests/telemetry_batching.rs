use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Map;

use chatreflex::{
    CloseOptions, EventType, InMemorySink, LivenessProbe, StreamState, TelemetryBatcher, TelemetryConfig,
    TelemetryEvent,
};

fn config(batch_size: usize, batch_time: Duration) -> TelemetryConfig {
    TelemetryConfig {
        batch_size,
        batch_time,
        max_wait: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        ..TelemetryConfig::default()
    }
}

fn event(n: usize) -> TelemetryEvent {
    TelemetryEvent::chat("chan", &format!("viewer{n}"), false, None, Map::new())
}

#[test]
fn full_batch_flushes_exactly_once() {
    let sink = Arc::new(InMemorySink::new());
    let batcher = TelemetryBatcher::new(Some(sink.clone()), config(5, Duration::from_secs(3600)), None).unwrap();

    for n in 0..5 {
        batcher.log(event(n));
    }
    let deadline = Instant::now() + Duration::from_secs(2);
    while sink.batch_sizes().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.batch_sizes(), vec![5]);
    assert_eq!(batcher.flushed_batches(), 1);
    assert!(batcher.close());
}

#[test]
fn partial_batch_waits_for_batch_time() {
    let sink = Arc::new(InMemorySink::new());
    let batcher = TelemetryBatcher::new(Some(sink.clone()), config(5, Duration::from_secs(3600)), None).unwrap();

    for n in 0..4 {
        batcher.log(event(n));
    }
    thread::sleep(Duration::from_millis(150));
    assert!(sink.batch_sizes().is_empty());

    assert!(batcher.close());
    assert_eq!(sink.batch_sizes(), vec![4]);
}

#[test]
fn close_returns_promptly_once_session_goes_live() {
    let sink = Arc::new(InMemorySink::new());
    let live = Arc::new(AtomicBool::new(false));
    let l = Arc::clone(&live);
    let probe: Arc<dyn LivenessProbe> = Arc::new(move || l.load(Ordering::SeqCst));

    let cfg = TelemetryConfig {
        grace_period: Duration::from_secs(10),
        ..config(50, Duration::from_secs(3600))
    };
    let batcher = TelemetryBatcher::new(Some(sink.clone()), cfg, Some(probe)).unwrap();
    batcher.log(event(1));

    let flipper = {
        let live = Arc::clone(&live);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            live.store(true, Ordering::SeqCst);
        })
    };

    let started = Instant::now();
    assert!(batcher.close());
    let elapsed = started.elapsed();
    flipper.join().unwrap();

    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(2), "close waited {elapsed:?}");
    assert_eq!(sink.rows().len(), 1);
}

#[test]
fn live_session_closes_immediately() {
    let sink = Arc::new(InMemorySink::new());
    let state = Arc::new(StreamState::new());
    state.set_online("chan", true);

    let batcher = TelemetryBatcher::new(Some(sink), config(50, Duration::from_secs(3600)), None).unwrap();
    let started = Instant::now();
    assert!(batcher.close_with(
        CloseOptions::default()
            .liveness(state.probe("chan"))
            .grace_period(Duration::from_secs(30))
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn keeps_flushing_during_grace_period() {
    let sink = Arc::new(InMemorySink::new());
    let probe: Arc<dyn LivenessProbe> = Arc::new(|| false);
    let cfg = TelemetryConfig {
        grace_period: Duration::from_millis(300),
        ..config(2, Duration::from_secs(3600))
    };
    let batcher = Arc::new(TelemetryBatcher::new(Some(sink.clone()), cfg, Some(probe)).unwrap());

    let closer = {
        let batcher = Arc::clone(&batcher);
        thread::spawn(move || batcher.close())
    };
    thread::sleep(Duration::from_millis(50));
    batcher.log(event(1));
    batcher.log(event(2));

    let deadline = Instant::now() + Duration::from_millis(250);
    while sink.batch_sizes().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sink.batch_sizes(), vec![2]);
    assert!(closer.join().unwrap());
}

#[test]
fn helpers_build_typed_rows() {
    let sink = Arc::new(InMemorySink::new());
    let batcher = TelemetryBatcher::new(Some(sink.clone()), config(50, Duration::from_secs(3600)), None).unwrap();

    batcher.log_chat("chan", "alice", true, Some("greeting".to_string()), Map::new());
    batcher.log_mod_action("chan", "spammer", "timeout", Map::new());
    batcher.log_trigger_event("chan", "greeting", "reply", Map::new());
    assert!(batcher.close());

    let kinds: Vec<EventType> = sink.rows().iter().map(|r| r.event_type).collect();
    assert_eq!(kinds, vec![EventType::ChatMessage, EventType::ModAction, EventType::TriggerEvent]);
    assert_eq!(sink.rows()[1].user, "spammer");
    assert_eq!(sink.rows()[1].name.as_deref(), Some("timeout"));
}

#[test]
fn missing_sink_disables_logging() {
    let batcher = TelemetryBatcher::new(None, TelemetryConfig::default(), None).unwrap();
    assert!(!batcher.is_enabled());
    for n in 0..100 {
        batcher.log(event(n));
    }
    assert_eq!(batcher.dropped(), 0);
    assert!(batcher.close());
}
