use super::AppState;
use crate::error::StoreError;
use crate::events::ProcessedEvent;
use crate::risk::MAX_SCORE;
use crate::storage::SearchQuery;
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use tracing::warn;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Store(e) => {
                warn!(error = %e, "store query failed");
                (StatusCode::SERVICE_UNAVAILABLE, "event store unavailable".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

type Events = Result<Json<Vec<ProcessedEvent>>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HighRiskParams {
    threshold: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    source_ip: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    min_risk_score: Option<i64>,
    limit: Option<i64>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn latest(State(state): State<AppState>, params: Result<Query<LatestParams>, QueryRejection>) -> Events {
    let Query(params) = params?;
    let limit = clamp_limit(params.limit, state.limits.default_limit, state.limits.max_limit);
    Ok(Json(state.store.query_latest(limit).await?))
}

pub async fn high_risk(
    State(state): State<AppState>,
    params: Result<Query<HighRiskParams>, QueryRejection>,
) -> Events {
    let Query(params) = params?;
    let threshold = match params.threshold {
        Some(t) => score_param("threshold", t)?,
        None => state.limits.high_threshold,
    };
    let limit = clamp_limit(params.limit, state.limits.high_risk_default_limit, state.limits.max_limit);
    Ok(Json(state.store.query_by_risk_threshold(threshold, limit).await?))
}

pub async fn search(State(state): State<AppState>, params: Result<Query<SearchParams>, QueryRejection>) -> Events {
    let Query(params) = params?;
    let query = search_query(params, &state)?;
    Ok(Json(state.store.query_search(&query).await?))
}

fn search_query(params: SearchParams, state: &AppState) -> Result<SearchQuery, ApiError> {
    let source_ip = match params.source_ip.filter(|s| !s.is_empty()) {
        Some(ip) => {
            ip.parse::<IpAddr>()
                .map_err(|_| ApiError::BadRequest(format!("source_ip is not an IP address: {ip}")))?;
            Some(ip)
        }
        None => None,
    };
    let start = params
        .start_date
        .as_deref()
        .map(|s| parse_bound("start_date", s, false))
        .transpose()?;
    let end = params
        .end_date
        .as_deref()
        .map(|s| parse_bound("end_date", s, true))
        .transpose()?;
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(ApiError::BadRequest("start_date is after end_date".into()));
        }
    }
    let min_score = params
        .min_risk_score
        .map(|m| score_param("min_risk_score", m))
        .transpose()?;

    Ok(SearchQuery {
        source_ip,
        start,
        end,
        min_score,
        limit: clamp_limit(params.limit, state.limits.default_limit, state.limits.max_limit),
    })
}

fn clamp_limit(requested: Option<i64>, default: usize, max: usize) -> usize {
    match requested {
        Some(n) if n < 1 => 1,
        Some(n) => usize::try_from(n).unwrap_or(max).min(max),
        None => default.min(max),
    }
}

fn score_param(name: &str, value: i64) -> Result<u8, ApiError> {
    u8::try_from(value)
        .ok()
        .filter(|v| *v <= MAX_SCORE)
        .ok_or_else(|| ApiError::BadRequest(format!("{name} must be between 0 and {MAX_SCORE}")))
}

/// RFC 3339, or a bare `YYYY-MM-DD` covering the whole UTC day.
fn parse_bound(name: &str, raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("{name} must be RFC 3339 or YYYY-MM-DD")))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    };
    let time = time.ok_or_else(|| ApiError::BadRequest(format!("{name} is out of range")))?;
    Ok(day.and_time(time).and_utc())
}
