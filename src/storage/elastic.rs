//! Elasticsearch-backed source and store over the REST API.
//!
//! Raw records live in the sensor's index pattern (Filebeat by default) and are
//! flagged with `sentinel_processed: true` once handled. Processed events are
//! created in their own index with `_id` = source id, so a repeated write
//! conflicts instead of duplicating.

use super::{ProcessedEventStore, RawBatch, RawEventSource, SearchQuery, WriteOutcome};
use crate::config::ElasticConfig;
use crate::error::{ConfigError, StoreError};
use crate::events::{ProcessedEvent, RawEvent};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

pub const PROCESSED_FLAG: &str = "sentinel_processed";

pub struct ElasticStore {
    client: reqwest::Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
    source_index: String,
    processed_index: String,
}

/// Raw ids carry the concrete index since the source is usually a pattern.
fn raw_id(index: &str, doc_id: &str) -> String {
    format!("{}:{}", index, doc_id)
}

fn split_raw_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(':').filter(|(i, d)| !i.is_empty() && !d.is_empty())
}

/// Ordered by the sensor's capture `timestamp`, the field the decoder reads;
/// Filebeat's `@timestamp` only breaks ties and covers records without one.
pub(crate) fn unprocessed_query(limit: usize) -> Value {
    json!({
        "size": limit,
        "query": {"bool": {"must_not": [{"exists": {"field": PROCESSED_FLAG}}]}},
        "sort": [
            {"timestamp": {"order": "asc", "unmapped_type": "date", "missing": "_last"}},
            {"@timestamp": {"order": "asc"}}
        ]
    })
}

fn newest_first(limit: usize, query: Value) -> Value {
    json!({
        "size": limit,
        "query": query,
        "sort": [{"timestamp": {"order": "desc"}}, {"source_event_id": {"order": "asc"}}]
    })
}

pub(crate) fn latest_query(limit: usize) -> Value {
    newest_first(limit, json!({"match_all": {}}))
}

pub(crate) fn threshold_query(min_score: u8, limit: usize) -> Value {
    newest_first(limit, json!({"range": {"risk_score": {"gte": min_score}}}))
}

pub(crate) fn search_query(q: &SearchQuery) -> Value {
    let mut filters = Vec::new();
    if let Some(ip) = &q.source_ip {
        filters.push(json!({"term": {"source_ip": ip}}));
    }
    if q.start.is_some() || q.end.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(s) = q.start {
            range.insert("gte".into(), json!(s.to_rfc3339()));
        }
        if let Some(e) = q.end {
            range.insert("lte".into(), json!(e.to_rfc3339()));
        }
        filters.push(json!({"range": {"timestamp": range}}));
    }
    if let Some(min) = q.min_score {
        filters.push(json!({"range": {"risk_score": {"gte": min}}}));
    }
    newest_first(q.limit, json!({"bool": {"filter": filters}}))
}

pub(crate) fn processed_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "source_event_id": {"type": "keyword"},
                "source_ip": {"type": "keyword"},
                "source_port": {"type": "integer"},
                "session_id": {"type": "keyword"},
                "event_type": {"type": "keyword"},
                "geo": {"properties": {
                    "country": {"type": "keyword"},
                    "city": {"type": "keyword"}
                }},
                "time_bucket": {"type": "keyword"},
                "risk_score": {"type": "integer"},
                "risk_factors": {"properties": {
                    "name": {"type": "keyword"},
                    "weight": {"type": "integer"}
                }},
                "username": {"type": "keyword"},
                "command": {"type": "text"},
                "timestamp": {"type": "date"}
            }
        }
    })
}

fn hits(body: &Value) -> impl Iterator<Item = &Value> {
    body.pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

/// Decode a raw search response. Hits that do not decode keep their place as
/// undecodable ids so the processor can step over them.
fn raw_batch(body: &Value) -> RawBatch {
    let mut batch = RawBatch::default();
    for hit in hits(body) {
        let (Some(index), Some(doc_id)) = (
            hit.get("_index").and_then(Value::as_str),
            hit.get("_id").and_then(Value::as_str),
        ) else {
            continue;
        };
        let source = hit.get("_source").cloned().unwrap_or(Value::Null);
        match RawEvent::from_sensor_record(raw_id(index, doc_id), &source) {
            Ok(ev) => batch.events.push(ev),
            Err(e) => {
                warn!(event_id = %e.id, reason = %e.reason, "undecodable raw record");
                batch.undecodable.push(e.id);
            }
        }
    }
    batch
}

impl ElasticStore {
    pub fn new(config: &ElasticConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let url = config
            .url
            .as_deref()
            .ok_or(ConfigError::Missing("ELASTICSEARCH_URL"))?;
        let base_url = Url::parse(url).map_err(|e| ConfigError::Invalid {
            key: "ELASTICSEARCH_URL",
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::Invalid {
                key: "ELASTICSEARCH_URL",
                reason: format!("{} is not a base url", url),
            });
        }

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(!config.verify_certs);
        if let Some(path) = &config.ca_certs {
            let pem = std::fs::read(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ConfigError::Invalid {
                key: "ELASTICSEARCH_CA_CERTS",
                reason: e.to_string(),
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(|e| ConfigError::Invalid {
            key: "elasticsearch",
            reason: e.to_string(),
        })?;

        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            source_index: config.source_index.clone(),
            processed_index: config.processed_index.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable("base url cannot take a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let rb = self.client.request(method, url);
        match &self.username {
            Some(user) => rb.basic_auth(user, self.password.as_ref()),
            None => rb,
        }
    }

    /// Send and return status plus JSON body (Null if the body is not JSON).
    async fn send(&self, rb: RequestBuilder) -> Result<(StatusCode, Value), StoreError> {
        let res = rb.send().await?;
        let status = res.status();
        let text = res.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);
        if !status.is_success() && status != StatusCode::CONFLICT && status != StatusCode::NOT_FOUND {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok((status, body))
    }

    async fn search(&self, index: &str, body: Value) -> Result<Value, StoreError> {
        let url = self.url(&[index, "_search"])?;
        let (status, body) = self.send(self.request(Method::POST, url).json(&body)).await?;
        if status == StatusCode::NOT_FOUND {
            // Index (pattern) not created yet.
            return Ok(json!({"hits": {"hits": []}}));
        }
        Ok(body)
    }

    async fn search_processed(&self, body: Value) -> Result<Vec<ProcessedEvent>, StoreError> {
        let body = self.search(&self.processed_index, body).await?;
        hits(&body)
            .map(|h| {
                let src = h.get("_source").cloned().unwrap_or(Value::Null);
                serde_json::from_value(src).map_err(|e| StoreError::Decode(e.to_string()))
            })
            .collect()
    }

    /// Create the processed index with its mapping if it does not exist.
    pub async fn ensure_index(&self) -> Result<(), StoreError> {
        let url = self.url(&[&self.processed_index])?;
        let (status, _) = self.send(self.request(Method::HEAD, url.clone())).await?;
        if status.is_success() {
            return Ok(());
        }
        let res = self.send(self.request(Method::PUT, url).json(&processed_mapping())).await;
        match res {
            Ok(_) => {
                info!(index = %self.processed_index, "created processed index");
                Ok(())
            }
            Err(StoreError::Status { status: 400, body })
                if body.contains("resource_already_exists_exception") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RawEventSource for ElasticStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<RawBatch, StoreError> {
        let body = self.search(&self.source_index, unprocessed_query(limit)).await?;
        Ok(raw_batch(&body))
    }

    async fn mark_processed(&self, id: &str) -> Result<(), StoreError> {
        let (index, doc_id) =
            split_raw_id(id).ok_or_else(|| StoreError::UnknownRecord(id.to_string()))?;
        let url = self.url(&[index, "_update", doc_id])?;
        let body = json!({"doc": {PROCESSED_FLAG: true}});
        let (status, _) = self.send(self.request(Method::POST, url).json(&body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::UnknownRecord(id.to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let url = self.url(&[])?;
        let (status, body) = self.send(self.request(Method::GET, url)).await?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessedEventStore for ElasticStore {
    async fn write(&self, event: &ProcessedEvent) -> Result<WriteOutcome, StoreError> {
        let url = self.url(&[&self.processed_index, "_create", &event.source_event_id])?;
        let (status, body) = self.send(self.request(Method::PUT, url).json(event)).await?;
        match status {
            StatusCode::CONFLICT => Ok(WriteOutcome::Unchanged),
            StatusCode::NOT_FOUND => Err(StoreError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            }),
            _ => Ok(WriteOutcome::Created),
        }
    }

    async fn query_latest(&self, limit: usize) -> Result<Vec<ProcessedEvent>, StoreError> {
        self.search_processed(latest_query(limit)).await
    }

    async fn query_by_risk_threshold(
        &self,
        min_score: u8,
        limit: usize,
    ) -> Result<Vec<ProcessedEvent>, StoreError> {
        self.search_processed(threshold_query(min_score, limit)).await
    }

    async fn query_search(&self, query: &SearchQuery) -> Result<Vec<ProcessedEvent>, StoreError> {
        self.search_processed(search_query(query)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        RawEventSource::ping(self).await
    }
}
