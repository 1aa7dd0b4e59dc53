//! Read-only HTTP adapter over the processed event store.
//!
//! `GET /health` (and `/api/v1/health`) answer without a key. Everything
//! under `/api/v1/events` requires `X-API-KEY`.

mod auth;
mod handlers;

pub use auth::API_KEY_HEADER;

use crate::config::{ApiConfig, RiskConfig};
use crate::error::ConfigError;
use crate::storage::ProcessedEventStore;
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub default_limit: usize,
    pub high_risk_default_limit: usize,
    pub max_limit: usize,
    pub high_threshold: u8,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ProcessedEventStore>,
    pub api_key: Arc<str>,
    pub limits: QueryLimits,
}

impl AppState {
    pub fn new(store: Arc<dyn ProcessedEventStore>, api: &ApiConfig, risk: &RiskConfig) -> Result<Self, ConfigError> {
        let api_key = api
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Missing("API_KEY"))?;
        Ok(Self {
            store,
            api_key: Arc::from(api_key),
            limits: QueryLimits {
                default_limit: api.default_limit,
                high_risk_default_limit: api.high_risk_default_limit,
                max_limit: api.max_limit,
                high_threshold: risk.high_threshold,
            },
        })
    }
}

pub fn router(state: AppState) -> Router {
    let events = Router::new()
        .route("/events/latest", get(handlers::latest))
        .route("/events/high-risk", get(handlers::high_risk))
        .route("/events/search", get(handlers::search))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .route("/health", get(handlers::health))
        .nest(
            "/api/v1",
            Router::new().route("/health", get(handlers::health)).merge(events),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
