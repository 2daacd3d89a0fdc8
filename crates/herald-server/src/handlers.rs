//! HTTP handlers for the Herald server.
//!
//! `GET {handshake_path}/:id` opens a server-sent events stream for a
//! subscriber; `POST`/`GET {message_path}/:id` delivers a message to it.

use crate::config::Config;
use crate::metrics;
use crate::stream;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream::{self as futures_stream, Stream};
use herald_core::{HubError, Message, NotificationHub};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The notification hub.
    pub hub: Arc<NotificationHub>,
    /// Server configuration.
    pub config: Config,
    /// Flipped to `true` when the server starts shutting down.
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            hub: Arc::new(NotificationHub::with_config(config.hub.to_hub_config())),
            config,
            shutdown,
        }
    }
}

/// Errors returned to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Hub rejected the operation.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Message body too large.
    #[error("Message size {0} exceeds maximum {1}")]
    PayloadTooLarge(usize, usize),

    /// Event name not usable as an SSE event field.
    #[error("Invalid event name")]
    InvalidEvent,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Hub(HubError::AlreadySubscribed(_)) => StatusCode::CONFLICT,
            ApiError::Hub(HubError::NotSubscribed(_)) => StatusCode::NOT_FOUND,
            ApiError::Hub(HubError::DeliveryTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Hub(HubError::InvalidIdentity(_)) => StatusCode::BAD_REQUEST,
            ApiError::Hub(HubError::CapacityReached(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::PayloadTooLarge(..) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InvalidEvent => StatusCode::BAD_REQUEST,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Hub(e) => e.kind(),
            ApiError::PayloadTooLarge(..) => "payload_too_large",
            ApiError::InvalidEvent => "invalid_event",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error(self.kind());
        let body = Json(json!({ "message": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Query parameters accepted when delivering a message.
#[derive(Debug, Default, Deserialize)]
pub struct DeliverParams {
    /// SSE event name; defaults to `message`.
    pub event: Option<String>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let stream_config = &state.config.stream;
    let handshake = format!("{}/:id", stream_config.handshake_path.trim_end_matches('/'));
    let message = format!("{}/:id", stream_config.message_path.trim_end_matches('/'));

    Router::new()
        .route(&handshake, get(handshake_handler))
        .route(&message, get(greeting_handler).post(message_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Herald server listening on {}", addr);
    info!(
        "Stream endpoint: http://{}{}/:id",
        addr, config.stream.handshake_path
    );

    tokio::spawn(watch_signals(state.shutdown.clone()));

    let mut shutdown = state.shutdown.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stream::shutdown_signalled(&mut shutdown).await;
            info!("Herald server shutting down");
        })
        .await?;

    Ok(())
}

/// Flip the shutdown flag on SIGINT or SIGTERM.
async fn watch_signals(shutdown: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT, initiating shutdown"),
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                if let Err(e) = ctrl_c.await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                info!("Received SIGINT, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, initiating shutdown");
    }

    shutdown.send_replace(true);
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": state.hub.subscriber_count(),
    }))
}

/// Open a server-sent events stream for subscriber `id`.
async fn handshake_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let inbox = state.hub.subscribe(&id).map_err(|e| {
        warn!(subscriber = %id, error = %e, "Handshake rejected");
        e
    })?;
    metrics::record_subscription();
    metrics::set_active_subscribers(state.hub.subscriber_count());

    let (events_tx, events_rx) = mpsc::channel(1);
    tokio::spawn(stream::forward(
        Arc::clone(&state.hub),
        inbox,
        events_tx,
        state.shutdown.subscribe(),
    ));

    let events = futures_stream::unfold(events_rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.keep_alive())))
}

/// Deliver the request body to subscriber `id`.
async fn message_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeliverParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let max = state.config.stream.max_message_size;
    if body.len() > max {
        return Err(ApiError::PayloadTooLarge(body.len(), max));
    }

    let mut message = Message::new(body);
    if let Some(event) = params.event {
        if event.is_empty() || event.chars().any(char::is_control) {
            return Err(ApiError::InvalidEvent);
        }
        message = message.with_event(event);
    }

    deliver(&state, &id, message).await
}

/// Deliver a greeting to subscriber `id`.
async fn greeting_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message = Message::new(format!("Hello {id}"));
    deliver(&state, &id, message).await
}

async fn deliver(
    state: &AppState,
    id: &str,
    message: Message,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bytes = message.payload_size();
    let start = Instant::now();
    let result = state.hub.deliver(id, message).await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(()) => {
            metrics::record_delivery("ok", bytes, elapsed);
            debug!(subscriber = %id, bytes, "Message delivered");
            Ok(Json(json!({ "message": format!("message send to {id}") })))
        }
        Err(e) => {
            metrics::record_delivery(e.kind(), bytes, elapsed);
            warn!(subscriber = %id, error = %e, "Delivery failed");
            Err(e.into())
        }
    }
}
