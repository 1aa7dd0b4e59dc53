//! Sentinel configuration: JSON file, then environment overrides, then validation.

use crate::enrichment::GeoNetwork;
use crate::error::ConfigError;
use crate::risk::{default_rules, RiskScorer, ScoringRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Raw event source and processed event store
    pub store: StoreConfig,
    /// Polling cadence and batch sizing
    pub processor: ProcessorConfig,
    /// Scoring rules and risk thresholds
    pub risk: RiskConfig,
    /// Geo-location table
    pub geo: GeoConfig,
    /// Query API
    pub api: ApiConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Sqlite,
    Elasticsearch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
    pub elasticsearch: ElasticConfig,
    /// Per-call timeout for fetch / write / mark (seconds)
    pub timeout_secs: u64,
    /// How long startup waits for the store to answer (seconds)
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_certs: bool,
    pub ca_certs: Option<PathBuf>,
    /// Index (or pattern) the sensor pipeline writes raw records to
    pub source_index: String,
    pub processed_index: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Scores at or above this are high risk; also the default for `/events/high-risk`
    pub high_threshold: u8,
    /// Scores at or above this are medium risk
    pub medium_threshold: u8,
    /// Evaluated in order; factors are reported in this order
    pub rules: Vec<ScoringRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// JSON array of `{cidr, country, city?}`
    pub table_path: Option<PathBuf>,
    pub networks: Vec<GeoNetwork>,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Pre-shared secret expected in `X-API-KEY`. Required.
    pub api_key: Option<String>,
    pub default_limit: usize,
    pub high_risk_default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_path: PathBuf::from(".sentinel/sentinel.db"),
            elasticsearch: ElasticConfig::default(),
            timeout_secs: 10,
            ready_timeout_secs: 60,
        }
    }
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            verify_certs: true,
            ca_certs: None,
            source_index: "filebeat-*".to_string(),
            processed_index: "sentinel-events".to_string(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            batch_size: 100,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            high_threshold: 70,
            medium_threshold: 40,
            rules: default_rules(),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            table_path: None,
            networks: Vec::new(),
            cache_capacity: 4096,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            api_key: None,
            default_limit: 10,
            high_risk_default_limit: 25,
            max_limit: 500,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: format!("{:?}: {}", raw, e),
    })
}

fn non_empty(v: String) -> Option<String> {
    if v.trim().is_empty() {
        None
    } else {
        Some(v)
    }
}

impl SentinelConfig {
    /// Load from JSON file if present; otherwise defaults. A file that exists but
    /// cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply process environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|k| std::env::var(k).ok())
    }

    /// Apply overrides from any key lookup (environment in production, a map in tests).
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = get("API_KEY") {
            self.api.api_key = non_empty(v);
        }
        if let Some(v) = get("SENTINEL_STORE_BACKEND") {
            self.store.backend = match v.trim().to_ascii_lowercase().as_str() {
                "sqlite" => StoreBackend::Sqlite,
                "elasticsearch" | "elastic" => StoreBackend::Elasticsearch,
                other => {
                    return Err(ConfigError::Invalid {
                        key: "SENTINEL_STORE_BACKEND",
                        reason: format!("unknown backend {:?}", other),
                    })
                }
            };
        }
        if let Some(v) = get("SENTINEL_SQLITE_PATH") {
            self.store.sqlite_path = PathBuf::from(v);
        }
        if let Some(v) = get("SENTINEL_STORE_TIMEOUT_SECS") {
            self.store.timeout_secs = parse_env("SENTINEL_STORE_TIMEOUT_SECS", &v)?;
        }
        let es = &mut self.store.elasticsearch;
        if let Some(v) = get("ELASTICSEARCH_URL") {
            es.url = non_empty(v);
        }
        if let Some(v) = get("ELASTICSEARCH_USERNAME") {
            es.username = non_empty(v);
        }
        if let Some(v) = get("ELASTICSEARCH_PASSWORD") {
            es.password = non_empty(v);
        }
        if let Some(v) = get("ELASTICSEARCH_VERIFY_CERTS") {
            es.verify_certs = parse_env("ELASTICSEARCH_VERIFY_CERTS", &v.to_ascii_lowercase())?;
        }
        if let Some(v) = get("ELASTICSEARCH_CA_CERTS") {
            es.ca_certs = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = get("SOURCE_INDEX") {
            es.source_index = v;
        }
        if let Some(v) = get("PROCESSED_INDEX") {
            es.processed_index = v;
        }
        if let Some(v) = get("SENTINEL_POLL_INTERVAL_SECS") {
            self.processor.poll_interval_secs = parse_env("SENTINEL_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("SENTINEL_BATCH_SIZE") {
            self.processor.batch_size = parse_env("SENTINEL_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("SENTINEL_HIGH_RISK_THRESHOLD") {
            self.risk.high_threshold = parse_env("SENTINEL_HIGH_RISK_THRESHOLD", &v)?;
        }
        if let Some(v) = get("SENTINEL_BIND_ADDR") {
            self.api.bind_addr = v;
        }
        if let Some(v) = get("SENTINEL_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("SENTINEL_LOG_JSON") {
            self.log.json = parse_env("SENTINEL_LOG_JSON", &v.to_ascii_lowercase())?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(ConfigError::Missing("API_KEY"));
        }
        if self.store.backend == StoreBackend::Elasticsearch && self.store.elasticsearch.url.is_none() {
            return Err(ConfigError::Missing("ELASTICSEARCH_URL"));
        }
        if self.processor.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "processor.batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.processor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "processor.poll_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.store.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "store.timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.risk.high_threshold > 100 || self.risk.medium_threshold > 100 {
            return Err(ConfigError::Invalid {
                key: "risk",
                reason: "thresholds must be within 0-100".into(),
            });
        }
        if self.risk.medium_threshold > self.risk.high_threshold {
            return Err(ConfigError::Invalid {
                key: "risk.medium_threshold",
                reason: "must not exceed risk.high_threshold".into(),
            });
        }
        RiskScorer::new(&self.risk.rules)?;
        if self.api.default_limit == 0 || self.api.max_limit < self.api.default_limit {
            return Err(ConfigError::Invalid {
                key: "api.max_limit",
                reason: "limits must satisfy 1 <= default_limit <= max_limit".into(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.processor.poll_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_secs)
    }
}
