//! SQLite-backed raw event source and processed event store.
//! Records are stored as JSON with the filter/sort columns broken out.

use super::{ProcessedEventStore, RawBatch, RawEventSource, SearchQuery, WriteOutcome};
use crate::error::StoreError;
use crate::events::{ProcessedEvent, RawEvent};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS raw_events (
        id TEXT PRIMARY KEY,
        ts INTEGER NOT NULL,
        source_ip TEXT NOT NULL,
        event_type TEXT NOT NULL,
        record TEXT NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_raw_pending ON raw_events(processed, ts, id);

    CREATE TABLE IF NOT EXISTS processed_events (
        source_event_id TEXT PRIMARY KEY,
        ts INTEGER NOT NULL,
        source_ip TEXT NOT NULL,
        risk_score INTEGER NOT NULL,
        record TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_processed_ts ON processed_events(ts);
    CREATE INDEX IF NOT EXISTS idx_processed_score ON processed_events(risk_score, ts);
    CREATE INDEX IF NOT EXISTS idx_processed_ip ON processed_events(source_ip, ts);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn decode<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Decode(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Decode(e.to_string()))
}

impl SqliteStore {
    /// Open or create DB at path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Sensor-side append. Returns false if the id already exists.
    pub fn insert_raw(&self, event: &RawEvent) -> Result<bool, StoreError> {
        let record = encode(event)?;
        let n = self.conn.lock().unwrap_or_else(|e| e.into_inner()).execute(
            "INSERT OR IGNORE INTO raw_events (id, ts, source_ip, event_type, record, processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.timestamp.timestamp_micros(),
                event.source_ip,
                event.event_type.as_str(),
                record,
                event.processed,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_raw(&self, id: &str) -> Result<Option<RawEvent>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT record, processed FROM raw_events WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((json, processed)) => {
                let mut ev: RawEvent = decode(&json)?;
                ev.processed = processed;
                Ok(Some(ev))
            }
            None => Ok(None),
        }
    }

    pub fn processed_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM processed_events", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn query_processed(
    conn: &Connection,
    sql: &str,
    args: Vec<SqlValue>,
) -> Result<Vec<ProcessedEvent>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for json in rows {
        out.push(decode(&json?)?);
    }
    Ok(out)
}

#[async_trait]
impl RawEventSource for SqliteStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<RawBatch, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, record FROM raw_events WHERE processed = 0 ORDER BY ts ASC, id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut batch = RawBatch::default();
            for row in rows {
                let (id, json) = row?;
                match decode::<RawEvent>(&json) {
                    Ok(mut ev) => {
                        ev.processed = false;
                        batch.events.push(ev);
                    }
                    Err(e) => {
                        warn!(event_id = %id, error = %e, "undecodable raw row");
                        batch.undecodable.push(id);
                    }
                }
            }
            Ok(batch)
        })
        .await
    }

    async fn mark_processed(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("UPDATE raw_events SET processed = 1 WHERE id = ?1", params![id])?;
            if n == 0 {
                return Err(StoreError::UnknownRecord(id));
            }
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProcessedEventStore for SqliteStore {
    async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError> {
        let record = encode(event)?;
        let id = event.source_event_id.clone();
        let ts = event.timestamp.timestamp_micros();
        let ip = event.source_ip.clone();
        let score = i64::from(event.risk_score);
        self.with_conn(move |conn| {
            let n = conn.execute(
                "INSERT INTO processed_events (source_event_id, ts, source_ip, risk_score, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_event_id) DO NOTHING",
                params![id, ts, ip, score, record],
            )?;
            Ok(if n > 0 {
                WriteOutcome::Created
            } else {
                WriteOutcome::Unchanged
            })
        })
        .await
    }

    async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
        self.with_conn(move |conn| {
            query_processed(
                conn,
                "SELECT record FROM processed_events ORDER BY ts DESC, source_event_id ASC LIMIT ?1",
                vec![SqlValue::Integer(limit as i64)],
            )
        })
        .await
    }

    async fn query_by_risk_threshold(
        &self,
        min_score: u8,
        limit: usize,
    ) -> Result<Vec<ProcessedEvent>, StoreError> {
        self.with_conn(move |conn| {
            query_processed(
                conn,
                "SELECT record FROM processed_events WHERE risk_score >= ?1
                 ORDER BY ts DESC, source_event_id ASC LIMIT ?2",
                vec![
                    SqlValue::Integer(i64::from(min_score)),
                    SqlValue::Integer(limit as i64),
                ],
            )
        })
        .await
    }

    async fn query_search(&self, query: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError> {
        let mut clauses: Vec<&'static str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(ip) = &query.source_ip {
            clauses.push("source_ip = ?");
            args.push(SqlValue::Text(ip.clone()));
        }
        if let Some(start) = query.start {
            clauses.push("ts >= ?");
            args.push(SqlValue::Integer(start.timestamp_micros()));
        }
        if let Some(end) = query.end {
            clauses.push("ts <= ?");
            args.push(SqlValue::Integer(end.timestamp_micros()));
        }
        if let Some(min) = query.min_score {
            clauses.push("risk_score >= ?");
            args.push(SqlValue::Integer(i64::from(min)));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT record FROM processed_events {} ORDER BY ts DESC, source_event_id ASC LIMIT ?",
            filter
        );
        args.push(SqlValue::Integer(query.limit as i64));
        self.with_conn(move |conn| query_processed(conn, &sql, args)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        RawEventSource::ping(self).await
    }
}
