use crate::error::{Result, ServiceError};
use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{header::CONTENT_TYPE, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            ServiceError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "qrgate_requests_total",
            "Total number of HTTP requests received"
        );
        describe_histogram!(
            "qrgate_request_duration_seconds",
            "HTTP request latencies in seconds"
        );
        describe_counter!(
            "qrgate_rate_limit_decisions_total",
            "Rate limit decisions on protected routes, by outcome"
        );
        describe_gauge!(
            "qrgate_rate_limit_tracked_identities",
            "Number of client identities with a live token bucket"
        );
        describe_counter!(
            "qrgate_rate_limit_evicted_total",
            "Total number of idle token buckets evicted"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    let metrics = service.render();
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(metrics))
        .map_err(|e| ServiceError::Internal(format!("Failed to build metrics response: {}", e)))
}

/// Middleware recording request count and latency per matched route
pub async fn track_metrics(request: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let method = request.method().to_string();
    // Label by route template so unknown paths cannot blow up cardinality
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    record_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    response
}

/// Record a request metric
pub fn record_request(method: &str, path: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!("qrgate_requests_total", &labels).increment(1);
    histogram!("qrgate_request_duration_seconds", &labels).record(duration);
}

/// Record one gate decision
pub fn record_rate_limit_decision(route: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "rejected" };
    let labels = [("route", route.to_string()), ("outcome", outcome.to_string())];
    counter!("qrgate_rate_limit_decisions_total", &labels).increment(1);
}

pub fn record_tracked_identities(count: usize) {
    gauge!("qrgate_rate_limit_tracked_identities").set(count as f64);
}

pub fn record_evicted_buckets(count: usize) {
    counter!("qrgate_rate_limit_evicted_total").increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_service_creation() {
        // The global recorder can only be installed once per process
        match MetricsService::new() {
            Ok(service) => {
                record_rate_limit_decision("/api/qr", false);
                assert!(service.render().contains("qrgate_rate_limit_decisions_total"));
            }
            Err(e) => {
                assert!(e.to_string().contains("recorder") || e.to_string().contains("install"));
            }
        }
    }

    #[test]
    fn test_record_functions_dont_panic() {
        record_request("GET", "/api/qr/check-limit", 200, 0.002);
        record_rate_limit_decision("/api/qr", true);
        record_rate_limit_decision("/api/qr", false);
        record_tracked_identities(3);
        record_evicted_buckets(2);
    }
}
