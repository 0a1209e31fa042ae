// HTTP request handlers
//
// Push ingress, notification bridge, probes and triage endpoints

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::bridge::ObjectNotification;
use crate::dispatch::PushEnvelope;
use crate::queue::{ProcessingOutcome, UploadEvent};
use crate::worker::ProcessingError;
use crate::{AppError, AppState};

/// POST /push - one delivery attempt from the dispatcher
///
/// 200 acknowledges. Fatal failures answer 422 so the dispatcher dead-letters
/// immediately; retryable failures answer 503.
pub(crate) async fn handle_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    counter!("push.requests", 1);
    histogram!("push.bytes", body.len() as f64);

    if body.len() > state.max_payload_bytes {
        counter!("push.rejected", 1);
        return Err(AppError::with_status(
            StatusCode::PAYLOAD_TOO_LARGE,
            anyhow::anyhow!(
                "Payload size {} bytes exceeds limit of {} bytes",
                body.len(),
                state.max_payload_bytes
            ),
        ));
    }

    if let Some(tokens) = &state.tokens {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        match tokens.verify_header(authorization) {
            Ok(claims) => debug!(subject = %claims.sub, "Verified push identity"),
            Err(e) if tokens.enforce() => {
                counter!("push.unauthorized", 1);
                return Err(AppError::with_status(StatusCode::UNAUTHORIZED, e.into()));
            }
            Err(e) => warn!(error = %e, "Accepting push without a valid identity token"),
        }
    }

    let envelope: PushEnvelope = serde_json::from_slice(&body).map_err(|e| {
        AppError::with_status(
            StatusCode::BAD_REQUEST,
            anyhow::anyhow!("Invalid push envelope: {}", e),
        )
    })?;
    let attempt = envelope
        .into_attempt()
        .map_err(|e| AppError::with_status(StatusCode::BAD_REQUEST, e.into()))?;

    let report = state.worker.process(&attempt).await;
    let status = match report.outcome() {
        ProcessingOutcome::Acknowledged => StatusCode::OK,
        ProcessingOutcome::FatalFailure => StatusCode::UNPROCESSABLE_ENTITY,
        ProcessingOutcome::RetryableFailure => StatusCode::SERVICE_UNAVAILABLE,
    };

    let body = match &report.result {
        Ok(disposition) => json!({
            "status": "acknowledged",
            "messageId": report.message_id,
            "attempt": report.attempt_number,
            "idempotencyKey": report.idempotency_key,
            "disposition": disposition,
        }),
        Err(e) => json!({
            "status": report.outcome().as_str(),
            "messageId": report.message_id,
            "attempt": report.attempt_number,
            "error": e.to_string(),
            "kind": e.kind(),
            "state": report.states.iter().rev().nth(1).map(|s| s.as_str()),
        }),
    };
    Ok((status, Json(body)).into_response())
}

/// POST /notifications - object-store finalize event
pub(crate) async fn handle_notification(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let notification: ObjectNotification = serde_json::from_slice(&body).map_err(|e| {
        AppError::with_status(
            StatusCode::BAD_REQUEST,
            anyhow::anyhow!("Invalid notification: {}", e),
        )
    })?;
    let event = UploadEvent::from_notification(notification)
        .map_err(|e| AppError::with_status(StatusCode::BAD_REQUEST, e.into()))?;

    let message_id = state
        .queue
        .enqueue(event.clone())
        .await
        .map_err(|e| AppError::with_status(StatusCode::SERVICE_UNAVAILABLE, e.into()))?;
    counter!("bridge.notifications", 1);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "messageId": message_id,
            "idempotencyKey": event.idempotency_key(),
        })),
    )
        .into_response())
}

/// GET /health - liveness, independent of message processing
pub(crate) async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

/// GET /ready - startup complete and sink reachable
pub(crate) async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    if !state.ready.load(Ordering::Acquire) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "starting"})),
        );
    }
    match state.worker.sink().check().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ready"}))),
        Err(e) => {
            let e = ProcessingError::from(e);
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable", "error": e.to_string()})),
            )
        }
    }
}

/// GET /dead-letters - quarantined messages for manual triage
pub(crate) async fn list_dead_letters(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state.dead_letters.entries();
    Json(json!({
        "count": entries.len(),
        "pendingWrites": state.dead_letters.pending_writes(),
        "entries": entries,
    }))
}

/// GET /queue - live queue counters
pub(crate) async fn queue_stats(State(state): State<AppState>) -> Result<Response, AppError> {
    let stats = state
        .queue
        .stats()
        .await
        .map_err(|e| AppError::with_status(StatusCode::SERVICE_UNAVAILABLE, e.into()))?;
    Ok(Json(stats).into_response())
}
