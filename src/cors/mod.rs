use crate::error::{Result, ServiceError};
use crate::observability::REQUEST_ID_HEADER;
use crate::rate_limit::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use axum::http::{header::RETRY_AFTER, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::debug;

/// CORS configuration for the browser front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins (use ["*"] for all origins)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Allowed HTTP methods
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<String>,
    /// Allowed headers
    #[serde(default = "default_headers")]
    pub allowed_headers: Vec<String>,
    /// Extra exposed headers, on top of the rate limit headers
    #[serde(default)]
    pub exposed_headers: Vec<String>,
    /// Max age for preflight cache in seconds
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "OPTIONS".to_string()]
}

fn default_headers() -> Vec<String> {
    vec!["Content-Type".to_string()]
}

fn default_max_age() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: default_methods(),
            allowed_headers: default_headers(),
            exposed_headers: vec![],
            max_age_secs: default_max_age(),
        }
    }
}

/// Headers the front-end reads to show quota state
fn quota_headers() -> Vec<HeaderName> {
    vec![
        X_RATELIMIT_LIMIT,
        X_RATELIMIT_REMAINING,
        X_RATELIMIT_RESET,
        RETRY_AFTER,
        REQUEST_ID_HEADER,
    ]
}

impl CorsConfig {
    /// Build a CorsLayer from this configuration
    pub fn build_layer(&self) -> Result<CorsLayer> {
        let mut cors = CorsLayer::new();

        if self.allowed_origins.len() == 1 && self.allowed_origins[0] == "*" {
            cors = cors.allow_origin(AllowOrigin::any());
            debug!("CORS: Allowing all origins");
        } else {
            let origins = self
                .allowed_origins
                .iter()
                .map(|o| HeaderValue::from_str(o))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ServiceError::Config(format!("Invalid CORS origin value: {}", e)))?;

            cors = cors.allow_origin(origins);
            debug!(origins = ?self.allowed_origins, "CORS: Configured allowed origins");
        }

        let methods = self
            .allowed_methods
            .iter()
            .map(|m| Method::from_bytes(m.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ServiceError::Config(format!("Invalid CORS method: {}", e)))?;
        cors = cors.allow_methods(methods);

        if self.allowed_headers.len() == 1 && self.allowed_headers[0] == "*" {
            cors = cors.allow_headers(tower_http::cors::Any);
        } else {
            let headers = self
                .allowed_headers
                .iter()
                .map(|h| h.parse::<HeaderName>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ServiceError::Config(format!("Invalid CORS header name: {}", e)))?;
            cors = cors.allow_headers(headers);
        }

        let mut exposed = quota_headers();
        for name in &self.exposed_headers {
            let header = name.parse::<HeaderName>().map_err(|e| {
                ServiceError::Config(format!("Invalid exposed header name: {}", e))
            })?;
            if !exposed.contains(&header) {
                exposed.push(header);
            }
        }
        debug!(headers = ?exposed, "CORS: Configured exposed headers");
        cors = cors.expose_headers(exposed);

        cors = cors.max_age(Duration::from_secs(self.max_age_secs));

        Ok(cors)
    }

    /// Check that every configured origin, method and header parses
    pub fn validate(&self) -> Result<()> {
        self.build_layer().map(drop)
    }
}
