//! Decoding of Cowrie sensor log records into [`RawEvent`]s.

use super::{EventPayload, EventType, RawEvent};
use crate::error::MalformedRecord;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::BufRead;
use tracing::warn;

/// Envelope keys that become first-class fields rather than payload.
const ENVELOPE_KEYS: &[&str] = &[
    "eventid",
    "src_ip",
    "src_port",
    "session",
    "timestamp",
    "@timestamp",
    "@version",
    "sentinel_processed",
];

/// Stable id for a log line: hex SHA-256 of its bytes.
pub fn ingest_id(line: &str) -> String {
    let mut h = Sha256::new();
    h.update(line.trim_end().as_bytes());
    format!("{:x}", h.finalize())
}

impl RawEvent {
    /// Build a raw event from one sensor record. Requires `src_ip` and a parseable
    /// `timestamp` (or Filebeat's `@timestamp`).
    pub fn from_sensor_record(id: impl Into<String>, record: &Value) -> Result<Self, MalformedRecord> {
        let id = id.into();
        let obj = record
            .as_object()
            .ok_or_else(|| MalformedRecord::new(&id, "record is not a JSON object"))?;

        let event_type = obj
            .get("eventid")
            .and_then(Value::as_str)
            .map(EventType::from_sensor_id)
            .unwrap_or(EventType::Unknown);

        let source_ip = obj
            .get("src_ip")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedRecord::new(&id, "missing src_ip"))?
            .to_string();

        let source_port = obj
            .get("src_port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok());

        let session_id = obj
            .get("session")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let ts = obj
            .get("timestamp")
            .or_else(|| obj.get("@timestamp"))
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedRecord::new(&id, "missing timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| MalformedRecord::new(&id, format!("bad timestamp {:?}: {}", ts, e)))?;

        let processed = obj
            .get("sentinel_processed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let payload = obj
            .iter()
            .filter(|(k, _)| !ENVELOPE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(RawEvent {
            id,
            source_ip,
            source_port,
            session_id,
            event_type,
            payload: EventPayload(payload),
            timestamp,
            processed,
        })
    }
}

/// Outcome of loading a sensor log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Decode each JSON line and hand it to `insert`, which returns false for an
/// id it already holds. Undecodable lines are counted and logged, not fatal.
pub fn ingest_lines<R, E>(reader: R, mut insert: impl FnMut(&RawEvent) -> Result<bool, E>) -> Result<IngestReport, E>
where
    R: BufRead,
    E: From<std::io::Error>,
{
    let mut report = IngestReport::default();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let id = ingest_id(&line);
        let event = serde_json::from_str::<Value>(&line)
            .map_err(|e| MalformedRecord::new(&id, e.to_string()))
            .and_then(|v| RawEvent::from_sensor_record(id, &v));
        match event {
            Ok(ev) => {
                if insert(&ev)? {
                    report.inserted += 1;
                } else {
                    report.duplicates += 1;
                }
            }
            Err(e) => {
                warn!(line = n + 1, reason = %e.reason, "rejected sensor record");
                report.rejected += 1;
            }
        }
    }
    Ok(report)
}
