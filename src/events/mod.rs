//! Honeypot event model: raw sensor records and their processed form.

mod processed;
mod sensor;

pub use processed::ProcessedEvent;
pub use sensor::{ingest_id, ingest_lines, IngestReport};

use crate::error::MalformedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unmodified record as captured by the sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub session_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Connection,
    LoginAttempt,
    LoginSuccess,
    CommandExecuted,
    FileDownload,
    FileUpload,
    SessionClosed,
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Map a Cowrie `eventid` to an event type.
    pub fn from_sensor_id(eventid: &str) -> Self {
        match eventid {
            "cowrie.session.connect" => EventType::Connection,
            "cowrie.login.failed" => EventType::LoginAttempt,
            "cowrie.login.success" => EventType::LoginSuccess,
            "cowrie.command.input" | "cowrie.command.failed" => EventType::CommandExecuted,
            "cowrie.session.file_download" => EventType::FileDownload,
            "cowrie.session.file_upload" => EventType::FileUpload,
            "cowrie.session.closed" => EventType::SessionClosed,
            _ => EventType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connection => "connection",
            EventType::LoginAttempt => "login-attempt",
            EventType::LoginSuccess => "login-success",
            EventType::CommandExecuted => "command-executed",
            EventType::FileDownload => "file-download",
            EventType::FileUpload => "file-upload",
            EventType::SessionClosed => "session-closed",
            EventType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string())
    }
}

/// Event-type-specific fields (credentials tried, command text, sensor geoip, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPayload(pub Map<String, Value>);

impl EventPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String field lookup. Absent and null are `None`; any other non-string
    /// value means the record is malformed.
    fn text<'a>(&'a self, id: &str, key: &str) -> Result<Option<&'a str>, MalformedRecord> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(MalformedRecord::new(
                id,
                format!("{} should be a string, found {}", key, type_name(other)),
            )),
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl RawEvent {
    pub fn new(
        id: impl Into<String>,
        source_ip: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source_ip: source_ip.into(),
            source_port: None,
            session_id: String::new(),
            event_type,
            payload: EventPayload::default(),
            timestamp,
            processed: false,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn username(&self) -> Result<Option<&str>, MalformedRecord> {
        self.payload.text(&self.id, "username")
    }

    pub fn password(&self) -> Result<Option<&str>, MalformedRecord> {
        self.payload.text(&self.id, "password")
    }

    /// Command text. Required for command-executed events.
    pub fn command(&self) -> Result<Option<&str>, MalformedRecord> {
        let input = self.payload.text(&self.id, "input")?;
        if input.is_none() && self.event_type == EventType::CommandExecuted {
            return Err(MalformedRecord::new(
                &self.id,
                "command-executed event without input",
            ));
        }
        Ok(input)
    }
}
