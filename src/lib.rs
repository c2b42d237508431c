pub mod config;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod rate_limit;
pub mod validation;

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::handlers::{CHECK_LIMIT_PATH, HEALTH_PATH, VALIDATE_PATH};
use crate::metrics::{metrics_handler, track_metrics, MetricsService};
use crate::observability::{make_request_span, request_id_middleware};
use crate::rate_limit::{
    rate_limit_middleware, spawn_eviction_task, Clock, RateLimitGate, RateLimiter, SystemClock,
};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router as AxumRouter,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Build the HTTP application.
///
/// The gate wraps every route but only acts on paths under the configured
/// protected prefix. CORS sits outside the gate so preflight requests never
/// spend tokens.
pub fn build_app(
    config: &ServiceConfig,
    gate: Option<RateLimitGate>,
    metrics: Option<MetricsService>,
) -> Result<AxumRouter> {
    let mut app = AxumRouter::new()
        .route(CHECK_LIMIT_PATH, get(handlers::check_limit))
        .route(VALIDATE_PATH, get(handlers::validate))
        .route(HEALTH_PATH, get(handlers::health));

    if let Some(service) = metrics {
        app = app.merge(
            AxumRouter::new()
                .route(&config.metrics.path, get(metrics_handler))
                .with_state(service),
        );
    }

    if let Some(gate) = gate {
        app = app.layer(from_fn_with_state(gate, rate_limit_middleware));
    }

    app = app.layer(from_fn(track_metrics));

    if let Some(cors) = &config.cors {
        app = app.layer(cors.build_layer()?);
    }

    Ok(app
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.timeout_secs,
        )))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .layer(from_fn(request_id_middleware)))
}

/// Initialize and run the service until a shutdown signal arrives
pub async fn init_service(config: ServiceConfig) -> Result<()> {
    config.validate()?;

    info!("Starting qrgate");

    let metrics = if config.metrics.enabled {
        Some(MetricsService::new()?)
    } else {
        None
    };

    let limits = &config.rate_limiting;
    let (gate, eviction) = if limits.enabled {
        info!(
            max_tokens = limits.max_tokens,
            window_ms = limits.window_ms,
            prefix = %limits.protected_prefix,
            "Rate limiting enabled"
        );

        let limiter = Arc::new(RateLimiter::new(limits.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let eviction = limits
            .eviction
            .enabled
            .then(|| spawn_eviction_task(limiter.clone(), clock.clone()));

        (Some(RateLimitGate::with_clock(limiter, clock)), eviction)
    } else {
        warn!("Rate limiting disabled; protected routes are open");
        (None, None)
    };

    let app = build_app(&config, gate, metrics)?;

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ServiceError::Internal(format!("Server error: {}", e)))?;

    if let Some(handle) = eviction {
        handle.abort();
    }

    info!("qrgate stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
