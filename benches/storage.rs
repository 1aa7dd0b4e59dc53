//! SQLite store benchmark: processed event writes and latest-N queries.

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sentinel_pipeline::enrichment::TimeBucket;
use sentinel_pipeline::events::{EventType, ProcessedEvent};
use sentinel_pipeline::storage::{ProcessedEventStore, SqliteStore};
use tempfile::tempdir;

fn event(n: u64) -> ProcessedEvent {
    ProcessedEvent {
        source_event_id: format!("ev-{n}"),
        source_ip: "203.0.113.7".into(),
        source_port: Some(2222),
        session_id: "bench".into(),
        event_type: EventType::LoginAttempt,
        geo: None,
        time_bucket: TimeBucket::Night,
        risk_score: (n % 101) as u8,
        risk_factors: Vec::new(),
        username: Some("root".into()),
        command: None,
        timestamp: Utc.timestamp_millis_opt(1_714_500_000_000 + n as i64).unwrap(),
    }
}

fn bench_write(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("bench.db")).unwrap();
    let mut n = 0u64;

    c.bench_function("sqlite_write_processed", |b| {
        b.to_async(&rt).iter(|| {
            n += 1;
            let ev = event(n);
            let store = &store;
            async move { black_box(store.write(&ev).await).unwrap() }
        })
    });
}

fn bench_query_latest(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("bench.db")).unwrap();
    rt.block_on(async {
        for n in 0..5_000 {
            store.write(&event(n)).await.unwrap();
        }
    });

    c.bench_function("sqlite_query_latest_50", |b| {
        b.to_async(&rt).iter(|| async { black_box(store.query_latest(50).await).unwrap() })
    });
}

criterion_group!(benches, bench_write, bench_query_latest);
criterion_main!(benches);
