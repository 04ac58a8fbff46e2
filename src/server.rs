//! Inbound HTTP servers.
//!
//! The gateway server terminates `POST /_matrix/push/v1/notify` plus the
//! health endpoints; the metrics server, when enabled, exposes the
//! Prometheus registry on its own bind address.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{HttpConfig, MetricsConfig};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::notification::parse_notify_request;

/// State shared by the notify handlers.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Metrics,
}

/// Build the gateway router.
pub fn router(state: Arc<AppState>, max_body_size: usize) -> Router {
    Router::new()
        .route("/_matrix/push/v1/notify", post(notify_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}

async fn notify_handler(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Response {
    state.metrics.notifications_received_total.inc();

    let notification = match parse_notify_request(&body) {
        Ok(notification) => notification,
        Err(e) => {
            state.metrics.notifications_invalid_total.inc();
            warn!(error = %e, "Rejecting notify request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let summary = state.dispatcher.dispatch(&notification).await;
    let status =
        StatusCode::from_u16(summary.response_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (status, Json(json!({ "rejected": summary.rejected }))).into_response()
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    let pushkins = state.dispatcher.registry().len();
    let body = Json(json!({
        "status": if pushkins > 0 { "ready" } else { "not_ready" },
        "pushkins": pushkins,
    }));
    if pushkins > 0 {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

/// The gateway HTTP server; binds every configured address.
pub struct GatewayServer {
    config: HttpConfig,
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(config: HttpConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Run until shutdown is signaled. Bind failures are fatal.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = router(self.state.clone(), self.config.max_body_size);

        let mut listeners = Vec::new();
        for address in &self.config.bind_addresses {
            let listener = TcpListener::bind((address.as_str(), self.config.port))
                .await
                .map_err(|e| {
                    std::io::Error::new(
                        e.kind(),
                        format!("failed to bind '{address}:{}': {e}", self.config.port),
                    )
                })?;
            info!(address = %address, port = self.config.port, "Gateway listening");
            listeners.push(listener);
        }

        let mut handles = Vec::new();
        for listener in listeners {
            let app = app.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Gateway server error"),
                Err(e) => error!(error = %e, "Gateway server task panicked"),
            }
        }

        Ok(())
    }
}

/// Prometheus metrics server on its own bind address.
pub struct MetricsServer {
    config: MetricsConfig,
    metrics: Metrics,
}

impl MetricsServer {
    pub fn new(config: MetricsConfig, metrics: Metrics) -> Self {
        Self { config, metrics }
    }

    /// Run until shutdown is signaled; a no-op when disabled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            let _ = shutdown.changed().await;
            return Ok(());
        }

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.metrics.clone());

        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!(
                        "failed to bind metrics server to '{}': {e}",
                        self.config.bind_address
                    ),
                )
            })?;
        info!(address = %self.config.bind_address, "Metrics server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
                info!("Metrics server shutting down");
            })
            .await?;

        Ok(())
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metrics.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics".to_string(),
        )
            .into_response();
    }

    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!(error = %e, "Metrics buffer is not valid UTF-8");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics".to_string(),
            )
                .into_response()
        }
    }
}
