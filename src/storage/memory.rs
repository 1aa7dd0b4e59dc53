//! In-process source and store. Used by tests and local demos.

use super::{ProcessedEventStore, RawBatch, RawEventSource, SearchQuery, WriteOutcome};
use crate::error::StoreError;
use crate::events::{ProcessedEvent, RawEvent};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    raw: Mutex<HashMap<String, RawEvent>>,
    processed: Mutex<BTreeMap<String, ProcessedEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already present.
    pub fn insert_raw(&self, event: RawEvent) -> bool {
        let mut raw = self.raw.lock().unwrap_or_else(|e| e.into_inner());
        if raw.contains_key(&event.id) {
            return false;
        }
        raw.insert(event.id.clone(), event);
        true
    }

    pub fn raw_event(&self, id: &str) -> Option<RawEvent> {
        self.raw.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    pub fn processed_event(&self, source_id: &str) -> Option<ProcessedEvent> {
        self.processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
            .cloned()
    }

    pub fn processed_len(&self) -> usize {
        self.processed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn pending_len(&self) -> usize {
        self.raw
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| !e.processed)
            .count()
    }

    fn newest_first(&self, limit: usize, keep: impl Fn(&ProcessedEvent) -> bool) -> Vec<ProcessedEvent> {
        let processed = self.processed.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ProcessedEvent> = processed.values().filter(|e| keep(e)).cloned().collect();
        out.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.source_event_id.cmp(&b.source_event_id))
        });
        out.truncate(limit);
        out
    }
}

#[async_trait]
impl RawEventSource for MemoryStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<RawBatch, StoreError> {
        let raw = self.raw.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<RawEvent> = raw.values().filter(|e| !e.processed).cloned().collect();
        pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending.into())
    }

    async fn mark_processed(&self, id: &str) -> Result<(), StoreError> {
        let mut raw = self.raw.lock().unwrap_or_else(|e| e.into_inner());
        match raw.get_mut(id) {
            Some(e) => {
                e.processed = true;
                Ok(())
            }
            None => Err(StoreError::UnknownRecord(id.to_string())),
        }
    }
}

#[async_trait]
impl ProcessedEventStore for MemoryStore {
    async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError> {
        let mut processed = self.processed.lock().unwrap_or_else(|e| e.into_inner());
        if processed.contains_key(&event.source_event_id) {
            return Ok(WriteOutcome::Unchanged);
        }
        processed.insert(event.source_event_id.clone(), event.clone());
        Ok(WriteOutcome::Created)
    }

    async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
        Ok(self.newest_first(limit, |_| true))
    }

    async fn query_by_risk_threshold(
        &self,
        min_score: u8,
        limit: usize,
    ) -> Result<Vec<ProcessedEvent>, StoreError> {
        Ok(self.newest_first(limit, |e| e.risk_score >= min_score))
    }

    async fn query_search(&self, query: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError> {
        Ok(self.newest_first(query.limit, |e| query.matches(e)))
    }
}
