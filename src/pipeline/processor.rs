//! One fetch → enrich → score → write → mark cycle.

use crate::config::RiskConfig;
use crate::enrichment::Enricher;
use crate::error::{CycleError, MalformedRecord, StoreError};
use crate::events::{ProcessedEvent, RawEvent};
use crate::risk::{RiskLevel, RiskScorer};
use crate::storage::{ProcessedEventStore, RawBatch, RawEventSource, WriteOutcome};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a cycle did. Skipped ids were left unprocessed; `parked` counts
/// records skipped by an earlier cycle that this one stepped over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub written: usize,
    pub duplicates: usize,
    pub high_risk: usize,
    pub skipped: Vec<String>,
    pub parked: usize,
}

pub struct Processor {
    source: Arc<dyn RawEventSource>,
    store: Arc<dyn ProcessedEventStore>,
    enricher: Enricher,
    scorer: RiskScorer,
    risk: RiskConfig,
    batch_size: usize,
    timeout: Duration,
    /// Ids skipped by earlier cycles. They stay unprocessed at the source but
    /// are fetched past, so they cannot hold up newer records.
    parked: Mutex<HashSet<String>>,
}

impl Processor {
    pub fn new(
        source: Arc<dyn RawEventSource>,
        store: Arc<dyn ProcessedEventStore>,
        enricher: Enricher,
        scorer: RiskScorer,
        risk: RiskConfig,
    ) -> Self {
        Self {
            source,
            store,
            enricher,
            scorer,
            risk,
            batch_size: 100,
            timeout: Duration::from_secs(10),
            parked: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Bound on every fetch / write / mark call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enrich and score one record. Pure apart from geo cache lookups.
    pub fn evaluate(&self, raw: &RawEvent) -> Result<ProcessedEvent, MalformedRecord> {
        let enrichment = self.enricher.resolve(raw);
        let assessment = self.scorer.score(raw, &enrichment)?;
        ProcessedEvent::assemble(raw, enrichment, assessment)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout {
                operation,
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        self.run_cycle_inner(None).await
    }

    /// Like [`run_cycle`](Self::run_cycle) but stops between events once
    /// `cancel` reads true. A write is always followed by its mark attempt.
    pub async fn run_cycle_until(&self, cancel: &watch::Receiver<bool>) -> Result<CycleReport, CycleError> {
        self.run_cycle_inner(Some(cancel)).await
    }

    /// Number of skipped records currently being stepped over.
    pub fn parked_len(&self) -> usize {
        self.parked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn park(&self, report: &mut CycleReport, id: &str) {
        report.skipped.push(id.to_string());
        self.parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
    }

    /// Forget parked ids the source no longer returns. Only valid when the
    /// fetch came back short, i.e. it held every unprocessed record.
    fn release_parked(&self, fetched: &RawBatch) {
        let present: HashSet<&str> = fetched
            .events
            .iter()
            .map(|e| e.id.as_str())
            .chain(fetched.undecodable.iter().map(String::as_str))
            .collect();
        self.parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id| present.contains(id.as_str()));
    }

    async fn run_cycle_inner(&self, cancel: Option<&watch::Receiver<bool>>) -> Result<CycleReport, CycleError> {
        let parked = self.parked.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let limit = self.batch_size + parked.len();
        let fetched = self
            .bounded("fetch_unprocessed", self.source.fetch_unprocessed(limit))
            .await
            .map_err(CycleError::Fetch)?;
        if fetched.len() < limit {
            self.release_parked(&fetched);
        }

        let mut report = CycleReport::default();
        for id in &fetched.undecodable {
            if parked.contains(id) {
                report.parked += 1;
            } else {
                warn!(event_id = %id, "skipping undecodable record");
                report.fetched += 1;
                self.park(&mut report, id);
            }
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        for raw in fetched.events {
            if parked.contains(&raw.id) {
                report.parked += 1;
            } else if batch.len() < self.batch_size {
                batch.push(raw);
            }
        }
        report.fetched += batch.len();

        if batch.is_empty() {
            debug!(parked = report.parked, skipped = report.skipped.len(), "no unprocessed events");
            return Ok(report);
        }

        for (done, raw) in batch.iter().enumerate() {
            if cancel.is_some_and(|rx| *rx.borrow()) {
                info!(completed = done, remaining = batch.len() - done, "cycle cancelled");
                return Err(CycleError::Cancelled {
                    completed: done,
                    report,
                });
            }

            let processed = match self.evaluate(raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!(event_id = %e.id, reason = %e.reason, "skipping malformed record");
                    self.park(&mut report, &raw.id);
                    continue;
                }
            };

            match self.bounded("write", self.store.write(&processed)).await {
                Ok(WriteOutcome::Created) => report.written += 1,
                Ok(WriteOutcome::Unchanged) => {
                    debug!(event_id = %raw.id, "processed event already stored");
                    report.duplicates += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(CycleError::Write {
                        id: raw.id.clone(),
                        source: e,
                    })
                }
                Err(e) => {
                    warn!(event_id = %raw.id, error = %e, "store rejected processed event; leaving unprocessed");
                    self.park(&mut report, &raw.id);
                    continue;
                }
            }

            match self.bounded("mark_processed", self.source.mark_processed(&raw.id)).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    return Err(CycleError::Mark {
                        id: raw.id.clone(),
                        source: e,
                    })
                }
                Err(e) => {
                    warn!(event_id = %raw.id, error = %e, "could not mark event processed");
                    self.park(&mut report, &raw.id);
                    continue;
                }
            }

            if RiskLevel::from_score(processed.risk_score, &self.risk) == RiskLevel::High {
                report.high_risk += 1;
                let factors: Vec<&str> = processed.risk_factors.iter().map(|f| f.name.as_str()).collect();
                warn!(
                    event_id = %raw.id,
                    source_ip = %processed.source_ip,
                    score = processed.risk_score,
                    factors = ?factors,
                    "high-risk event"
                );
            }
        }

        info!(
            fetched = report.fetched,
            written = report.written,
            duplicates = report.duplicates,
            skipped = report.skipped.len(),
            parked = report.parked,
            high_risk = report.high_risk,
            "cycle complete"
        );
        Ok(report)
    }
}
