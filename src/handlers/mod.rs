use crate::validation::{validate_url, ValidationResult};
use axum::{extract::Query, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Route the front-end polls before rendering a download
pub const CHECK_LIMIT_PATH: &str = "/api/qr/check-limit";
pub const VALIDATE_PATH: &str = "/api/validate";
pub const HEALTH_PATH: &str = "/health";

/// Lightweight status probe behind the rate limit gate.
///
/// The body carries nothing; the quota headers added by the gate (or the
/// 429 it returns instead) are the answer.
pub async fn check_limit() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    #[serde(default)]
    pub url: String,
}

pub async fn validate(Query(query): Query<ValidateQuery>) -> Json<ValidationResult> {
    let result = validate_url(&query.url);
    debug!(valid = result.valid, reason = %result.reason, "Validated URL");
    Json(result)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
