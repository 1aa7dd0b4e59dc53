//! Enriched, risk-scored derivative of a raw event.

use super::{EventType, RawEvent};
use crate::enrichment::{Enrichment, GeoLocation, TimeBucket};
use crate::error::MalformedRecord;
use crate::risk::{RiskAssessment, RiskFactor};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// At most one per source raw event id; immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub source_event_id: String,
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub session_id: String,
    pub event_type: EventType,
    pub geo: Option<GeoLocation>,
    pub time_bucket: TimeBucket,
    pub risk_score: u8,
    pub risk_factors: Vec<RiskFactor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Capture time in UTC, millisecond precision.
    pub timestamp: DateTime<Utc>,
}

impl ProcessedEvent {
    pub fn assemble(
        raw: &RawEvent,
        enrichment: Enrichment,
        assessment: RiskAssessment,
    ) -> Result<Self, MalformedRecord> {
        Ok(Self {
            source_event_id: raw.id.clone(),
            source_ip: raw.source_ip.trim().to_string(),
            source_port: raw.source_port,
            session_id: raw.session_id.clone(),
            event_type: raw.event_type,
            geo: enrichment.geo,
            time_bucket: enrichment.time_bucket,
            risk_score: assessment.score,
            risk_factors: assessment.factors,
            username: raw.username()?.map(str::to_string),
            command: raw.command()?.map(str::to_string),
            timestamp: normalize_timestamp(raw.timestamp),
        })
    }
}

pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}
