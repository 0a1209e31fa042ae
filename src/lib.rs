// journal2parquet - reliable ingestion of point-of-sale journal logs
//
// Uploaded journals flow through:
// - Notification bridge (pushed finalize events or listing poller)
// - Message queue with ack deadline, exponential backoff and dead-lettering
// - Push dispatcher (in-process, or HTTP with identity tokens)
// - Processing worker state machine
// - Idempotent Parquet sink keyed by object generation
//
// The HTTP server hosts the push ingress, the bridge endpoint, probes and the
// dead-letter export. Graceful shutdown on SIGINT/SIGTERM.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod dead_letter;
pub mod dispatch;
mod handlers;
pub mod init;
pub mod journal;
pub mod queue;
pub mod sink;
pub mod source;
pub mod storage;
pub mod worker;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use config::RuntimeConfig;

use auth::IdentityTokens;
use bridge::ListingBridge;
use dead_letter::DeadLetterQueue;
use dispatch::HttpPushTarget;
use handlers::{
    handle_notification, handle_push, health_check, list_dead_letters, queue_stats, ready_check,
};
use queue::{DeliveryTarget, MessageQueue, QueueHandle, QueueSettings};
use worker::{Worker, WorkerSettings};

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<Worker>,
    pub queue: QueueHandle,
    pub dead_letters: DeadLetterQueue,
    pub tokens: Option<Arc<IdentityTokens>>,
    /// Flipped once startup is complete.
    pub ready: Arc<AtomicBool>,
    pub max_payload_bytes: usize,
    pub max_concurrency: usize,
}

/// Error type that implements IntoResponse
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request error: {:?}", self.error);
        } else {
            warn!("Request rejected ({}): {}", self.status, self.error);
        }
        (
            self.status,
            Json(json!({
                "error": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

impl AppError {
    pub fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    let push = post(handle_push).layer(ConcurrencyLimitLayer::new(state.max_concurrency.max(1)));

    Router::new()
        .route("/push", push)
        .route("/notifications", post(handle_notification))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/dead-letters", get(list_dead_letters))
        .route("/queue", get(queue_stats))
        .layer(DefaultBodyLimit::max(state.max_payload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point for server mode with pre-loaded configuration
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init::init_tracing(&config.server);
    info!("journal2parquet {} starting", env!("CARGO_PKG_VERSION"));

    let source = Arc::new(init::init_source(&config)?);
    let sink = Arc::new(init::init_sink(&config)?);
    let tokens = init::init_identity(&config)?;
    let worker = Arc::new(Worker::new(
        source.clone(),
        sink,
        WorkerSettings::from_config(&config),
    ));
    let dead_letters = init::init_dead_letters(&config).await?;

    let target: Arc<dyn DeliveryTarget> = match &config.dispatcher.endpoint {
        Some(endpoint) => {
            let timeout = config
                .dispatcher
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.queue.ack_deadline());
            info!("Dispatching deliveries to {}", endpoint);
            Arc::new(HttpPushTarget::new(
                endpoint.clone(),
                timeout,
                tokens.clone(),
            )?)
        }
        None => {
            info!("Dispatching deliveries to the in-process worker");
            worker.clone() as Arc<dyn DeliveryTarget>
        }
    };

    let mut queue = MessageQueue::new(QueueSettings::from_config(&config.queue))
        .on_delivery(target)
        .dead_letters(dead_letters.clone());
    if let Some(store) = init::init_queue_store(&config)? {
        queue = queue.store(store);
    }
    let (queue_handle, queue_task) = queue.start().await.context("Failed to start queue")?;
    info!(
        "Queue started: ack_deadline={}s, backoff={}s..{}s x{}, max_attempts={}, fatal_short_circuit={}",
        config.queue.ack_deadline_secs,
        config.queue.min_backoff_secs,
        config.queue.max_backoff_secs,
        config.queue.backoff_multiplier,
        config.queue.max_delivery_attempts,
        config.queue.fatal_short_circuit
    );

    let bridge_task = if config.bridge.poll_enabled {
        let bridge = ListingBridge::new(
            source,
            queue_handle.clone(),
            config.bridge.prefix.clone(),
            config.worker.exclude_segment.clone(),
        );
        Some(bridge.spawn(Duration::from_secs(config.bridge.poll_interval_secs)))
    } else {
        None
    };

    let state = AppState {
        worker,
        queue: queue_handle.clone(),
        dead_letters: dead_letters.clone(),
        tokens: tokens.map(Arc::new),
        ready: Arc::new(AtomicBool::new(false)),
        max_payload_bytes: config.worker.max_payload_bytes,
        max_concurrency: config.worker.max_concurrency,
    };
    let ready = state.ready.clone();
    let app = router(state);

    let addr = &config.server.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("journal2parquet listening on http://{}", addr);
    info!("Routes:");
    info!("  POST http://{}/push          - Push delivery ingress", addr);
    info!("  POST http://{}/notifications - Object finalize notifications", addr);
    info!("  GET  http://{}/health        - Liveness", addr);
    info!("  GET  http://{}/ready         - Readiness", addr);
    info!("  GET  http://{}/dead-letters  - Dead-letter export", addr);
    info!("  GET  http://{}/queue         - Queue statistics", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");
    ready.store(true, Ordering::Release);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(task) = bridge_task {
        task.abort();
    }
    if let Ok(stats) = queue_handle.stats().await {
        if stats.live > 0 {
            warn!(
                "{} message(s) still live at shutdown{}",
                stats.live,
                if config.queue.state_uri.is_some() {
                    "; they resume on next start"
                } else {
                    " and will be lost (no queue.state_uri)"
                }
            );
        }
    }
    queue_task.abort();

    match dead_letters.flush().await {
        Ok(0) => {}
        Ok(n) => info!("Persisted {} pending dead-letter entries", n),
        Err(e) => error!("Dead-letter entries could not be persisted: {}", e),
    }

    info!("Server shutdown complete");

    Ok(())
}
