//! Metrics and health HTTP endpoints

use crate::broker::{BrokerClient, ConnectionState};
use crate::config::{HealthCheckConfig, MetricsConfig};
use crate::metrics::MetricsRegistry;
use crate::pipeline::PipelineContext;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared state for the health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub subscriber: Arc<BrokerClient>,
    pub publisher: Arc<BrokerClient>,
    pub ctx: Arc<PipelineContext>,
}

/// Serve the Prometheus text exposition until shutdown.
pub async fn serve_metrics(
    config: MetricsConfig,
    metrics: MetricsRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, path = %config.path, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

/// Serve `/health` and `/health/detailed` until shutdown.
pub async fn serve_health(
    config: HealthCheckConfig,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(health_detailed_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<MetricsRegistry>) -> impl IntoResponse {
    match metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// 200 when both broker roles are connected and the quarantine store is
/// writable, else 503.
async fn health_handler(State(state): State<HealthState>) -> StatusCode {
    if health_snapshot(&state).await.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health_detailed_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = health_snapshot(&state).await;
    let status = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if snapshot.healthy { "ok" } else { "degraded" },
            "components": {
                "subscriber": {
                    "state": snapshot.subscriber_state,
                    "connected": snapshot.subscriber_state == ConnectionState::Connected,
                },
                "publisher": {
                    "state": snapshot.publisher_state,
                    "connected": snapshot.publisher_state == ConnectionState::Connected,
                },
                "quarantine-store": {
                    "writable": snapshot.store_writable,
                    "records": snapshot.quarantine_records,
                },
            },
        })),
    )
}

struct HealthSnapshot {
    healthy: bool,
    subscriber_state: ConnectionState,
    publisher_state: ConnectionState,
    store_writable: bool,
    quarantine_records: u64,
}

async fn health_snapshot(state: &HealthState) -> HealthSnapshot {
    let subscriber_state = state.subscriber.state();
    let publisher_state = state.publisher.state();

    let store = state.ctx.store().clone();
    let (store_writable, quarantine_records) =
        tokio::task::spawn_blocking(move || (store.is_writable(), store.count().unwrap_or(0)))
            .await
            .unwrap_or((false, 0));

    HealthSnapshot {
        healthy: subscriber_state == ConnectionState::Connected
            && publisher_state == ConnectionState::Connected
            && store_writable,
        subscriber_state,
        publisher_state,
        store_writable,
        quarantine_records,
    }
}
