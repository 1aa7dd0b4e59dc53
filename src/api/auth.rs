//! Pre-shared key check for every non-health route.

use super::AppState;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";

fn key_matches(given: &[u8], expected: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(given, expected).is_ok()
}

fn reject(detail: &'static str) -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "detail": detail }))).into_response()
}

/// Rejects before the handler runs, so a bad key never reaches the store.
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match req.headers().get(API_KEY_HEADER) {
        None => {
            debug!(path = %req.uri().path(), "request without api key");
            reject("Not authenticated")
        }
        Some(given) if key_matches(given.as_bytes(), state.api_key.as_bytes()) => next.run(req).await,
        Some(_) => {
            debug!(path = %req.uri().path(), "request with wrong api key");
            reject("Could not validate credentials")
        }
    }
}
