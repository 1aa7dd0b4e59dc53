//! Narrow interfaces to the raw event source and the processed event store,
//! plus the in-memory, SQLite and Elasticsearch backends.

mod elastic;
mod memory;
mod sqlite;

pub use elastic::ElasticStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{ConfigError, StoreError};
use crate::events::{ProcessedEvent, RawEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Append-only feed of sensor records. Only the processing loop calls
/// `mark_processed`.
#[async_trait]
pub trait RawEventSource: Send + Sync {
    /// Unprocessed records, oldest capture timestamp first. At most `limit`
    /// records in total, decoded or not.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<RawBatch, StoreError>;

    async fn mark_processed(&self, id: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One page of unprocessed records. Records the source holds but cannot
/// decode are reported by id, in fetch order, next to the decoded ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub events: Vec<RawEvent>,
    pub undecodable: Vec<String>,
}

impl RawBatch {
    pub fn len(&self) -> usize {
        self.events.len() + self.undecodable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<RawEvent>> for RawBatch {
    fn from(events: Vec<RawEvent>) -> Self {
        Self {
            events,
            undecodable: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// A processed event for this source id already existed; nothing changed.
    Unchanged,
}

/// Durable store of processed events, keyed by source raw event id.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Upsert keyed by `source_event_id`; safe to call twice.
    async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError>;

    /// Most recent first.
    async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError>;

    async fn query_by_risk_threshold(
        &self,
        min_score: u8,
        limit: usize,
    ) -> Result<Vec<ProcessedEvent>, StoreError>;

    async fn query_search(&self, query: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Filters combined with logical AND; absent filters match everything.
/// Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub source_ip: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub min_score: Option<u8>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn matches(&self, e: &ProcessedEvent) -> bool {
        self.source_ip.as_deref().map_or(true, |ip| e.source_ip == ip)
            && self.start.map_or(true, |s| e.timestamp >= s)
            && self.end.map_or(true, |end| e.timestamp <= end)
            && self.min_score.map_or(true, |m| e.risk_score >= m)
    }
}

/// Source and store handles for the configured backend.
#[derive(Clone)]
pub struct Backend {
    pub source: Arc<dyn RawEventSource>,
    pub store: Arc<dyn ProcessedEventStore>,
    pub sqlite: Option<Arc<SqliteStore>>,
    pub elastic: Option<Arc<ElasticStore>>,
}

impl Backend {
    pub fn open(config: &StoreConfig) -> Result<Self, OpenError> {
        match config.backend {
            StoreBackend::Sqlite => {
                if let Some(parent) = config.sqlite_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                    }
                }
                let db = Arc::new(SqliteStore::open(&config.sqlite_path)?);
                Ok(Self {
                    source: db.clone(),
                    store: db.clone(),
                    sqlite: Some(db),
                    elastic: None,
                })
            }
            StoreBackend::Elasticsearch => {
                let es = Arc::new(ElasticStore::new(
                    &config.elasticsearch,
                    std::time::Duration::from_secs(config.timeout_secs),
                )?);
                Ok(Self {
                    source: es.clone(),
                    store: es.clone(),
                    sqlite: None,
                    elastic: Some(es),
                })
            }
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            source: store.clone(),
            store,
            sqlite: None,
            elastic: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
