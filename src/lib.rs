//! Sentinel: honeypot threat-event pipeline.
//!
//! Modular structure:
//! - [`events`]: Raw sensor records and their processed derivatives
//! - [`enrichment`]: Geo-location and time-of-day context
//! - [`risk`]: Declarative weighted risk scoring
//! - [`storage`]: Raw event source and processed event store backends
//! - [`pipeline`]: Scheduled fetch/enrich/score/store/mark loop
//! - [`api`]: Read-only query API
//! - [`logging`]: Structured JSON logging

pub mod api;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod risk;
pub mod storage;

pub use config::SentinelConfig;
pub use enrichment::{Enricher, Enrichment, GeoLocation, TimeBucket};
pub use error::{ConfigError, CycleError, MalformedRecord, StoreError};
pub use events::{EventType, ProcessedEvent, RawEvent};
pub use logging::StructuredLogger;
pub use pipeline::{LoopHandle, ProcessingLoop, Processor};
pub use risk::{RiskLevel, RiskScorer, ScoringRule};
pub use storage::{Backend, MemoryStore, ProcessedEventStore, RawBatch, RawEventSource, SqliteStore};
