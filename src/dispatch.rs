//! Push delivery over HTTP.
//!
//! Each delivery attempt is wrapped in a push envelope and POSTed to the
//! worker's `/push` endpoint with a bearer identity token. The response
//! status decides the outcome:
//!
//! | status        | outcome   |
//! |---------------|-----------|
//! | 2xx           | ack       |
//! | 400, 422      | fatal     |
//! | anything else | retryable |
//!
//! Transport errors and timeouts are retryable.

use crate::auth::IdentityTokens;
use crate::queue::{DeliveryAttempt, DeliveryReport, DeliveryTarget, MessageId, UploadEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DELIVERED_AT_ATTRIBUTE: &str = "deliveredAt";
pub const IDEMPOTENCY_KEY_ATTRIBUTE: &str = "idempotencyKey";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64 of the JSON-encoded [`UploadEvent`].
    pub data: String,
    pub message_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
    #[serde(default)]
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("message data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("message data is not an upload event: {0}")]
    Event(#[from] serde_json::Error),
    #[error("message id is empty")]
    MissingMessageId,
    #[error("delivery attempt must be at least 1")]
    InvalidAttempt,
}

impl PushEnvelope {
    pub fn from_attempt(attempt: &DeliveryAttempt, subscription: &str) -> Result<Self> {
        let event = serde_json::to_vec(&attempt.upload_event)
            .context("Failed to encode upload event")?;
        let mut attributes = BTreeMap::new();
        attributes.insert(
            DELIVERED_AT_ATTRIBUTE.to_string(),
            attempt.delivered_at.to_rfc3339(),
        );
        attributes.insert(
            IDEMPOTENCY_KEY_ATTRIBUTE.to_string(),
            attempt.upload_event.idempotency_key().to_string(),
        );

        Ok(Self {
            message: PushMessage {
                data: BASE64.encode(event),
                message_id: attempt.message_id.to_string(),
                attributes,
            },
            subscription: subscription.to_string(),
            delivery_attempt: Some(attempt.attempt_number),
        })
    }

    /// Reconstruct the delivery attempt carried by this envelope.
    ///
    /// A missing attempt number means a first delivery; a missing delivery
    /// time means "now".
    pub fn into_attempt(self) -> std::result::Result<DeliveryAttempt, EnvelopeError> {
        if self.message.message_id.trim().is_empty() {
            return Err(EnvelopeError::MissingMessageId);
        }
        let attempt_number = self.delivery_attempt.unwrap_or(1);
        if attempt_number == 0 {
            return Err(EnvelopeError::InvalidAttempt);
        }

        let data = BASE64.decode(self.message.data.trim())?;
        let upload_event: UploadEvent = serde_json::from_slice(&data)?;
        let delivered_at = self
            .message
            .attributes
            .get(DELIVERED_AT_ATTRIBUTE)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(DeliveryAttempt {
            message_id: MessageId::from(self.message.message_id),
            upload_event,
            attempt_number,
            delivered_at,
        })
    }
}

/// Outcome for an HTTP status returned by the push endpoint.
pub fn report_for_status(status: StatusCode, body: &str) -> DeliveryReport {
    if status.is_success() {
        DeliveryReport::acknowledged()
    } else if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        DeliveryReport::fatal(format!("push rejected with {}: {}", status, body))
    } else {
        DeliveryReport::retryable(format!("push failed with {}: {}", status, body))
    }
}

/// [`DeliveryTarget`] that pushes to a remote worker.
pub struct HttpPushTarget {
    client: reqwest::Client,
    endpoint: String,
    subscription: String,
    tokens: Option<IdentityTokens>,
}

impl HttpPushTarget {
    pub fn new(
        endpoint: impl Into<String>,
        request_timeout: Duration,
        tokens: Option<IdentityTokens>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            subscription: "journal2parquet-push".to_string(),
            tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn push(&self, attempt: &DeliveryAttempt) -> Result<DeliveryReport> {
        let envelope = PushEnvelope::from_attempt(attempt, &self.subscription)?;
        let mut request = self.client.post(&self.endpoint).json(&envelope);
        if let Some(tokens) = &self.tokens {
            let minted = tokens.mint(Utc::now()).context("Failed to mint identity token")?;
            request = request.bearer_auth(minted.token);
        }

        let response = request.send().await.context("Push request failed")?;
        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string())
        };
        Ok(report_for_status(status, &body))
    }
}

#[async_trait]
impl DeliveryTarget for HttpPushTarget {
    async fn deliver(&self, attempt: DeliveryAttempt) -> DeliveryReport {
        match self.push(&attempt).await {
            Ok(report) => {
                debug!(
                    message_id = %attempt.message_id,
                    attempt = attempt.attempt_number,
                    outcome = report.outcome.as_str(),
                    "Push completed"
                );
                report
            }
            Err(e) => {
                warn!(
                    message_id = %attempt.message_id,
                    attempt = attempt.attempt_number,
                    error = %format!("{:#}", e),
                    "Push did not reach the worker"
                );
                DeliveryReport::retryable(format!("{:#}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ProcessingOutcome;

    fn attempt() -> DeliveryAttempt {
        DeliveryAttempt {
            message_id: MessageId::generate(),
            upload_event: UploadEvent::new("journals", "logs/2024-01-01.log", 1),
            attempt_number: 3,
            delivered_at: Utc::now(),
        }
    }

    #[test]
    fn envelope_carries_the_attempt() {
        let original = attempt();
        let envelope = PushEnvelope::from_attempt(&original, "sub").unwrap();

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["deliveryAttempt"], 3);
        assert!(json["message"]["messageId"].is_string());

        let decoded = envelope.into_attempt().unwrap();
        assert_eq!(decoded.message_id, original.message_id);
        assert_eq!(decoded.upload_event, original.upload_event);
        assert_eq!(decoded.attempt_number, 3);
    }

    #[test]
    fn minimal_envelope_defaults_to_first_attempt() {
        let event = UploadEvent::new("journals", "logs/a.log", 9);
        let body = serde_json::json!({
            "message": {
                "data": BASE64.encode(serde_json::to_vec(&event).unwrap()),
                "messageId": "m-1"
            }
        });
        let envelope: PushEnvelope = serde_json::from_value(body).unwrap();
        let decoded = envelope.into_attempt().unwrap();
        assert_eq!(decoded.attempt_number, 1);
        assert_eq!(decoded.upload_event.generation, 9);
    }

    #[test]
    fn bad_envelopes_are_rejected() {
        let mut envelope = PushEnvelope::from_attempt(&attempt(), "sub").unwrap();
        envelope.message.data = "!!not base64!!".into();
        assert!(matches!(
            envelope.into_attempt(),
            Err(EnvelopeError::Base64(_))
        ));

        let mut envelope = PushEnvelope::from_attempt(&attempt(), "sub").unwrap();
        envelope.message.data = BASE64.encode(b"{\"not\":\"an event\"}");
        assert!(matches!(
            envelope.into_attempt(),
            Err(EnvelopeError::Event(_))
        ));

        let mut envelope = PushEnvelope::from_attempt(&attempt(), "sub").unwrap();
        envelope.delivery_attempt = Some(0);
        assert!(matches!(
            envelope.into_attempt(),
            Err(EnvelopeError::InvalidAttempt)
        ));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            report_for_status(StatusCode::NO_CONTENT, "").outcome,
            ProcessingOutcome::Acknowledged
        );
        assert_eq!(
            report_for_status(StatusCode::BAD_REQUEST, "bad").outcome,
            ProcessingOutcome::FatalFailure
        );
        assert_eq!(
            report_for_status(StatusCode::UNPROCESSABLE_ENTITY, "bad").outcome,
            ProcessingOutcome::FatalFailure
        );
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(
                report_for_status(status, "").outcome,
                ProcessingOutcome::RetryableFailure,
                "{}",
                status
            );
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let target =
            HttpPushTarget::new("http://127.0.0.1:9/push", Duration::from_millis(200), None)
                .unwrap();
        let report = target.deliver(attempt()).await;
        assert_eq!(report.outcome, ProcessingOutcome::RetryableFailure);
    }
}
