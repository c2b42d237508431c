use super::clock::{Clock, SystemClock};
use super::limiter::RateLimiter;
use super::types::{Decision, RateLimitConfig};
use crate::metrics;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{
        header::{CONTENT_TYPE, RETRY_AFTER},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Request gate in front of the protected routes
#[derive(Clone)]
pub struct RateLimitGate {
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl RateLimitGate {
    /// Create a gate reading wall-clock time from the system clock
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self::with_clock(limiter, Arc::new(SystemClock))
    }

    /// Create a gate with an explicit time source
    pub fn with_clock(limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> Self {
        Self { limiter, clock }
    }

    fn config(&self) -> &RateLimitConfig {
        self.limiter.config()
    }

    /// Apply rate limiting to a request.
    ///
    /// Paths outside the protected prefix go straight to `next` without
    /// touching the limiter.
    pub async fn handle(&self, request: Request, next: Next) -> Response {
        let path = request.uri().path();
        if !self.config().protects(path) {
            return next.run(request).await;
        }

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let identity = client_identity(request.headers(), peer, self.config());

        let decision = self
            .limiter
            .check_and_consume(&identity, self.clock.now_ms());

        metrics::record_rate_limit_decision(&self.config().protected_prefix, decision.allowed);

        if !decision.allowed {
            warn!(
                identity = %identity,
                path = %path,
                retry_after_ms = ?decision.retry_after_ms,
                "Rejecting throttled request"
            );
            return create_rate_limit_response(&decision);
        }

        debug!(
            identity = %identity,
            remaining = decision.remaining,
            "Rate limit check passed"
        );

        let response = next.run(request).await;
        add_rate_limit_headers(response, &decision)
    }
}

/// Axum middleware function for rate limiting
pub async fn rate_limit_middleware(
    State(gate): State<RateLimitGate>,
    request: Request,
    next: Next,
) -> Response {
    gate.handle(request, next).await
}

/// Determine the accounting identity for a request.
///
/// Forwarding headers are consulted only when the deployment trusts its
/// proxy. Without any usable address the configured fallback identity is
/// returned, so unidentifiable clients share one bucket.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    config: &RateLimitConfig,
) -> String {
    if config.trust_forwarded_headers {
        let forwarded = header_str(headers, X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let real_ip = header_str(headers, X_REAL_IP)
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(ip) = forwarded.or(real_ip) {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| config.fallback_identity.clone())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Create a 429 Too Many Requests response with rate limit headers
fn create_rate_limit_response(decision: &Decision) -> Response {
    let retry_after_ms = decision.retry_after_ms.unwrap_or_default();

    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_ms));
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_ms));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    let body = format!(
        "Rate limit exceeded. Please try again in {} seconds.",
        decision.retry_after_secs()
    );

    (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response()
}

/// Add rate limit headers to admitted responses
pub fn add_rate_limit_headers(mut response: Response, decision: &Decision) -> Response {
    let headers = response.headers_mut();

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_ms));

    response
}
