//! Processing loop: fetch unprocessed raw events, enrich, score, store,
//! mark. One cycle at a time.

mod processor;
mod scheduler;

pub use processor::{CycleReport, Processor};
pub use scheduler::{LoopHandle, LoopStats, ProcessingLoop};

use crate::error::StoreError;
use crate::storage::{ProcessedEventStore, RawEventSource};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const READY_RETRY: Duration = Duration::from_secs(2);

/// Ping both ends every `retry` until they answer or `deadline` passes.
/// Returns the last ping error on expiry.
pub async fn wait_until_ready(
    source: &dyn RawEventSource,
    store: &dyn ProcessedEventStore,
    deadline: Duration,
    retry: Duration,
) -> Result<(), StoreError> {
    let give_up = Instant::now() + deadline;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(retry.max(Duration::from_millis(1)), async {
            source.ping().await?;
            store.ping().await
        })
        .await
        {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout {
                operation: "ping",
                after_ms: retry.as_millis() as u64,
            }),
        };
        match result {
            Ok(()) => {
                info!(attempt, "store ready");
                return Ok(());
            }
            Err(e) if Instant::now() + retry > give_up => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "store not ready; retrying");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::enrichment::{CidrGeoTable, Enricher, GeoNetwork};
    use crate::error::CycleError;
    use crate::events::{EventPayload, EventType, RawEvent};
    use crate::risk::RiskScorer;
    use crate::events::ProcessedEvent;
    use crate::storage::{MemoryStore, RawBatch, SearchQuery, WriteOutcome};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    fn enricher() -> Enricher {
        let table = CidrGeoTable::new(vec![GeoNetwork {
            cidr: "198.51.100.0/24".parse().unwrap(),
            country: "NL".into(),
            city: Some("Amsterdam".into()),
        }]);
        Enricher::new(Arc::new(table))
    }

    fn processor(source: Arc<dyn RawEventSource>, store: Arc<dyn ProcessedEventStore>) -> Processor {
        let risk = RiskConfig::default();
        let scorer = RiskScorer::from_config(&risk).unwrap();
        Processor::new(source, store, enricher(), scorer, risk)
            .with_batch_size(10)
            .with_timeout(Duration::from_millis(200))
    }

    fn raw(id: &str, hour: u32, minute: u32) -> RawEvent {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap();
        RawEvent::new(id, "198.51.100.7", EventType::Connection, ts)
    }

    fn root_login(id: &str) -> RawEvent {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        RawEvent::new(id, "198.51.100.7", EventType::LoginSuccess, ts)
            .with_payload(EventPayload::new().with("username", "root").with("password", "toor"))
    }

    fn malformed_at(id: &str, hour: u32, minute: u32) -> RawEvent {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap();
        RawEvent::new(id, "198.51.100.7", EventType::CommandExecuted, ts)
            .with_payload(EventPayload::new().with("input", 42))
    }

    fn malformed(id: &str) -> RawEvent {
        malformed_at(id, 9, 0)
    }

    #[tokio::test]
    async fn cycle_processes_backlog_and_marks_it() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(root_login("r1"));
        mem.insert_raw(raw("r2", 14, 0));
        let p = processor(mem.clone(), mem.clone());

        let report = p.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.written, 2);
        assert_eq!(report.high_risk, 0);
        assert_eq!(mem.pending_len(), 0);

        let login = mem.processed_event("r1").unwrap();
        assert_eq!(login.risk_score, 50);
        let names: Vec<_> = login.risk_factors.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["login-success", "elevated-privilege", "night"]);
        assert_eq!(login.geo.as_ref().map(|g| g.country.as_str()), Some("NL"));
    }

    #[tokio::test]
    async fn rerunning_is_a_no_op() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(raw("r1", 10, 0));
        let p = processor(mem.clone(), mem.clone());
        p.run_cycle().await.unwrap();
        let second = p.run_cycle().await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(mem.processed_len(), 1);
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_and_left_unprocessed() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(raw("a", 10, 0));
        mem.insert_raw(malformed("bad"));
        mem.insert_raw(raw("c", 11, 0));
        let p = processor(mem.clone(), mem.clone());

        let report = p.run_cycle().await.unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.skipped, vec!["bad".to_string()]);
        assert!(mem.processed_event("bad").is_none());
        assert!(!mem.raw_event("bad").unwrap().processed);

        let again = p.run_cycle().await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(again.parked, 1);
        assert!(again.skipped.is_empty());
    }

    #[tokio::test]
    async fn skipped_records_at_the_head_do_not_starve_newer_ones() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(malformed_at("bad1", 1, 0));
        mem.insert_raw(malformed_at("bad2", 1, 1));
        mem.insert_raw(raw("good", 9, 0));
        let p = processor(mem.clone(), mem.clone()).with_batch_size(2);

        let first = p.run_cycle().await.unwrap();
        assert_eq!(first.skipped, vec!["bad1".to_string(), "bad2".to_string()]);
        assert_eq!(first.written, 0);

        let second = p.run_cycle().await.unwrap();
        assert_eq!(second.written, 1);
        assert_eq!(second.parked, 2);
        assert!(mem.raw_event("good").unwrap().processed);
        assert!(!mem.raw_event("bad1").unwrap().processed);
        assert_eq!(mem.pending_len(), 2);
    }

    #[tokio::test]
    async fn parked_ids_are_released_once_the_source_drops_them() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(malformed("bad"));
        let p = processor(mem.clone(), mem.clone());
        p.run_cycle().await.unwrap();
        assert_eq!(p.parked_len(), 1);

        mem.mark_processed("bad").await.unwrap();
        let report = p.run_cycle().await.unwrap();
        assert_eq!(report.parked, 0);
        assert_eq!(p.parked_len(), 0);
    }

    /// Source with one record at the head that it cannot decode.
    struct CorruptHead {
        inner: MemoryStore,
    }

    #[async_trait]
    impl RawEventSource for CorruptHead {
        async fn fetch_unprocessed(&self, limit: usize) -> Result<RawBatch, StoreError> {
            let mut batch = self.inner.fetch_unprocessed(limit.saturating_sub(1)).await?;
            batch.undecodable.push("junk".into());
            Ok(batch)
        }
        async fn mark_processed(&self, id: &str) -> Result<(), StoreError> {
            self.inner.mark_processed(id).await
        }
    }

    #[tokio::test]
    async fn undecodable_records_are_reported_and_stepped_over() {
        let source = Arc::new(CorruptHead {
            inner: MemoryStore::new(),
        });
        source.inner.insert_raw(raw("a", 10, 0));
        let store = Arc::new(MemoryStore::new());
        let p = processor(source.clone(), store.clone()).with_batch_size(1);

        let first = p.run_cycle().await.unwrap();
        assert_eq!(first.skipped, vec!["junk".to_string()]);
        assert_eq!(first.written, 0);

        let second = p.run_cycle().await.unwrap();
        assert_eq!(second.written, 1);
        assert_eq!(second.parked, 1);
        assert!(store.processed_event("a").is_some());
    }

    /// Records the order in which ids reach the store.
    #[derive(Default)]
    struct Recording {
        inner: MemoryStore,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessedEventStore for Recording {
        async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError> {
            self.order.lock().unwrap().push(event.source_event_id.clone());
            self.inner.write(event).await
        }
        async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_latest(limit).await
        }
        async fn query_by_risk_threshold(&self, min: u8, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_by_risk_threshold(min, limit).await
        }
        async fn query_search(&self, q: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_search(q).await
        }
    }

    #[tokio::test]
    async fn events_are_written_oldest_first_up_to_the_batch_limit() {
        let mem = Arc::new(MemoryStore::new());
        for (id, minute) in [("e", 50), ("b", 20), ("d", 40), ("a", 10), ("c", 30)] {
            mem.insert_raw(raw(id, 10, minute));
        }
        let rec = Arc::new(Recording::default());
        let p = processor(mem.clone(), rec.clone()).with_batch_size(3);

        p.run_cycle().await.unwrap();
        assert_eq!(*rec.order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(mem.pending_len(), 2);
    }

    /// Source whose fetch always fails.
    struct Down;

    #[async_trait]
    impl RawEventSource for Down {
        async fn fetch_unprocessed(&self, _limit: usize) -> Result<RawBatch, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn mark_processed(&self, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_cycle() {
        let mem = Arc::new(MemoryStore::new());
        let p = processor(Arc::new(Down), mem.clone());
        assert!(matches!(p.run_cycle().await, Err(CycleError::Fetch(_))));
        assert_eq!(mem.processed_len(), 0);
    }

    /// Store that fails the first `failures` writes with a transient error.
    struct Flaky {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ProcessedEventStore for Flaky {
        async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.inner.write(event).await
        }
        async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_latest(limit).await
        }
        async fn query_by_risk_threshold(&self, min: u8, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_by_risk_threshold(min, limit).await
        }
        async fn query_search(&self, q: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_search(q).await
        }
    }

    #[tokio::test]
    async fn transient_write_failure_leaves_event_for_next_cycle() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(raw("a", 10, 0));
        let flaky = Arc::new(Flaky {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(1),
        });
        let p = processor(mem.clone(), flaky.clone());

        assert!(matches!(p.run_cycle().await, Err(CycleError::Write { .. })));
        assert!(!mem.raw_event("a").unwrap().processed);

        let report = p.run_cycle().await.unwrap();
        assert_eq!(report.written, 1);
        assert!(mem.raw_event("a").unwrap().processed);
        assert_eq!(flaky.inner.processed_len(), 1);
    }

    /// Source whose mark fails once after the write has gone through.
    struct MarkFailsOnce {
        inner: MemoryStore,
        failed: AtomicUsize,
    }

    #[async_trait]
    impl RawEventSource for MarkFailsOnce {
        async fn fetch_unprocessed(&self, limit: usize) -> Result<RawBatch, StoreError> {
            self.inner.fetch_unprocessed(limit).await
        }
        async fn mark_processed(&self, id: &str) -> Result<(), StoreError> {
            if self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::Timeout {
                    operation: "mark_processed",
                    after_ms: 200,
                });
            }
            self.inner.mark_processed(id).await
        }
    }

    #[tokio::test]
    async fn crash_between_write_and_mark_rewrites_harmlessly() {
        let source = Arc::new(MarkFailsOnce {
            inner: MemoryStore::new(),
            failed: AtomicUsize::new(0),
        });
        source.inner.insert_raw(raw("a", 10, 0));
        let store = Arc::new(MemoryStore::new());
        let p = processor(source.clone(), store.clone());

        assert!(matches!(p.run_cycle().await, Err(CycleError::Mark { .. })));
        assert_eq!(store.processed_len(), 1);

        let report = p.run_cycle().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.written, 0);
        assert_eq!(store.processed_len(), 1);
        assert_eq!(source.inner.pending_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_cycle_stops_before_the_next_event() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(raw("a", 10, 0));
        mem.insert_raw(raw("b", 11, 0));
        let p = processor(mem.clone(), mem.clone());
        let (_tx, rx) = watch::channel(true);

        assert!(matches!(
            p.run_cycle_until(&rx).await,
            Err(CycleError::Cancelled { completed: 0, .. })
        ));
        assert_eq!(mem.processed_len(), 0);
        assert_eq!(mem.pending_len(), 2);
    }

    /// Store that raises the stop signal on its first write.
    struct StopOnWrite {
        inner: MemoryStore,
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl ProcessedEventStore for StopOnWrite {
        async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError> {
            let _ = self.stop.send(true);
            self.inner.write(event).await
        }
        async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_latest(limit).await
        }
        async fn query_by_risk_threshold(&self, min: u8, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_by_risk_threshold(min, limit).await
        }
        async fn query_search(&self, q: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_search(q).await
        }
    }

    #[tokio::test]
    async fn cancelled_cycle_reports_the_work_it_finished() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(raw("a", 10, 0));
        mem.insert_raw(raw("b", 11, 0));
        let (tx, rx) = watch::channel(false);
        let store = Arc::new(StopOnWrite {
            inner: MemoryStore::new(),
            stop: tx,
        });
        let p = processor(mem.clone(), store.clone());

        match p.run_cycle_until(&rx).await {
            Err(CycleError::Cancelled { completed, report }) => {
                assert_eq!(completed, 1);
                assert_eq!(report.written, 1);
            }
            other => panic!("expected cancellation, got {:?}", other),
        }
        assert!(mem.raw_event("a").unwrap().processed);
        assert!(!mem.raw_event("b").unwrap().processed);
    }

    /// Store whose writes take a while, so a stop lands mid-cycle.
    struct SlowStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ProcessedEventStore for SlowStore {
        async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError> {
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.inner.write(event).await
        }
        async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_latest(limit).await
        }
        async fn query_by_risk_threshold(&self, min: u8, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_by_risk_threshold(min, limit).await
        }
        async fn query_search(&self, q: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError> {
            self.inner.query_search(q).await
        }
    }

    #[tokio::test]
    async fn stopping_mid_cycle_keeps_the_partial_counts() {
        let mem = Arc::new(MemoryStore::new());
        for (id, minute) in [("a", 0), ("b", 1), ("c", 2), ("d", 3)] {
            mem.insert_raw(raw(id, 10, minute));
        }
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
        });
        let handle = ProcessingLoop::new(Arc::new(processor(mem.clone(), store.clone())))
            .start(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = handle.stop().await;
        assert!(stats.written >= 1);
        assert_eq!(stats.written, store.inner.processed_len() as u64);
    }

    #[tokio::test]
    async fn zero_interval_does_not_panic() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(raw("a", 10, 0));
        let handle = ProcessingLoop::new(Arc::new(processor(mem.clone(), mem.clone())))
            .start(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        let stats = handle.stop().await;
        assert!(stats.cycles >= 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn loop_runs_until_stopped() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert_raw(root_login("a"));
        mem.insert_raw(raw("b", 14, 0));
        let handle = ProcessingLoop::new(Arc::new(processor(mem.clone(), mem.clone())))
            .start(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        let stats = handle.stop().await;
        assert!(stats.cycles >= 1);
        assert_eq!(stats.written, 2);
        assert_eq!(mem.processed_len(), 2);
    }

    #[tokio::test]
    async fn loop_survives_failing_cycles() {
        let mem = Arc::new(MemoryStore::new());
        let handle = ProcessingLoop::new(Arc::new(processor(Arc::new(Down), mem)))
            .start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());
        let stats = handle.stop().await;
        assert!(stats.failed_cycles >= 1);
        assert_eq!(stats.failed_cycles, stats.cycles);
    }

    #[tokio::test]
    async fn readiness_gives_up_after_deadline() {
        let mem = MemoryStore::new();
        let err = wait_until_ready(&Down, &mem, Duration::from_millis(30), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        wait_until_ready(&mem, &mem, Duration::from_millis(30), Duration::from_millis(10))
            .await
            .unwrap();
    }
}
