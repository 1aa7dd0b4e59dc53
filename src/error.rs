//! Error taxonomy: fatal configuration errors, transient store errors,
//! per-record malformation, and cycle-level failures.

use crate::pipeline::CycleReport;
use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("scoring rule {rule}: invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Failures talking to the raw event source or the processed event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode stored record: {0}")]
    Decode(String),

    #[error("unknown record id: {0}")]
    UnknownRecord(String),

    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// True for failures that are expected to clear on their own (timeouts,
    /// connectivity, 5xx). Decode problems and unknown ids are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout { .. } | StoreError::Unavailable(_) | StoreError::Http(_) => true,
            StoreError::Status { status, .. } => *status >= 500 || *status == 429,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StoreError::Task(_) => true,
            _ => false,
        }
    }
}

/// A single raw record whose payload does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record {id}: {reason}")]
pub struct MalformedRecord {
    pub id: String,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Why a processing cycle stopped early.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetching unprocessed events failed: {0}")]
    Fetch(#[source] StoreError),

    #[error("writing processed event for {id} failed: {source}")]
    Write {
        id: String,
        #[source]
        source: StoreError,
    },

    #[error("marking {id} processed failed: {source}")]
    Mark {
        id: String,
        #[source]
        source: StoreError,
    },

    /// `report` holds what the cycle finished before it stopped.
    #[error("cycle cancelled after {completed} events")]
    Cancelled {
        completed: usize,
        report: CycleReport,
    },
}
