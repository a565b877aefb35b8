use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use chatreflex::{
    DeliveryError, InMemoryTriggerStore, MatchEngine, MatchEngineConfig, NewTrigger, ReplySink, TriggerCache,
    TriggerId, TriggerStore,
};

fn make_engine(triggers: usize) -> (Arc<TriggerCache>, MatchEngine) {
    let store = Arc::new(InMemoryTriggerStore::new());
    // A realistic mix: plain words, alternations and capture groups.
    for i in 0..triggers {
        let pattern = match i % 3 {
            0 => format!("word{i}"),
            1 => format!("(?i)(hi|hello|hey) bot{i}"),
            _ => format!(r"cheer(?P<amount>\d+) tag{i}"),
        };
        store
            .insert_trigger(NewTrigger::reply(pattern, "ok").into_row(TriggerId::new()))
            .unwrap();
    }
    let cache = Arc::new(TriggerCache::new(store));
    cache.refresh().unwrap();
    let engine = MatchEngine::builder(Arc::clone(&cache))
        .config(MatchEngineConfig {
            workers: 1,
            ..MatchEngineConfig::default()
        })
        .build()
        .unwrap();
    (cache, engine)
}

fn bench_scan(c: &mut Criterion) {
    let (_cache, engine) = make_engine(256);
    let mut group = c.benchmark_group("matching");
    group.throughput(Throughput::Elements(1));

    group.bench_function("scan_256_no_match", |b| {
        b.iter(|| engine.matching("just a regular chat message with nothing special"));
    });

    group.bench_function("scan_256_match", |b| {
        b.iter(|| engine.matching("hey bot1 and word0"));
    });

    let sink: Arc<dyn ReplySink> = Arc::new(|_t: &str| -> Result<(), DeliveryError> { Ok(()) });
    group.bench_function("handle_message_roundtrip", |b| {
        b.iter(|| {
            engine
                .handle_message("viewer", "nothing to see", Arc::clone(&sink))
                .unwrap()
                .join()
                .unwrap()
        });
    });

    group.finish();
}

fn bench_refresh(c: &mut Criterion) {
    let (cache, _engine) = make_engine(256);
    c.bench_function("matching/refresh_256", |b| {
        b.iter(|| cache.refresh().unwrap());
    });
}

criterion_group!(matching, bench_scan, bench_refresh);
criterion_main!(matching);
