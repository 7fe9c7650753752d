// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HMAC-SHA256-signed outbound webhook delivery (spec §4.5, §6.3).
//!
//! Fired only from job handlers, never from the request path, so a slow or
//! unreachable receiver never blocks a client-facing call.

use crate::error::CoreError;
use crate::instance::{HealthCheckResult, StartupOperation};
use crate::upstream::retry::backoff_delay;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const MAX_ATTEMPTS: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Body posted to a configured webhook URL (spec §6.3's wire contract —
/// the one place in this crate where field names follow the external
/// camelCase convention rather than Rust's own).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Local instance id.
    pub instance_id: String,
    /// Upstream id, once assigned.
    pub upstream_id: Option<String>,
    /// Event name: `running`, `failed`, `timeout`, `ready`,
    /// `health_checking`, `startup_initiated`, `startup_completed`,
    /// `startup_failed`, `stopped`, or `deleted`.
    pub status: String,
    /// When the event was generated.
    pub timestamp: chrono::DateTime<Utc>,
    /// Milliseconds since the originating operation began, if known.
    pub elapsed_time: Option<u64>,
    /// Error detail, for failure events.
    pub error: Option<String>,
    /// Human-readable reason, for failure/timeout events.
    pub reason: Option<String>,
    /// Health-check snapshot, for health-related events.
    pub health_check: Option<HealthCheckResult>,
    /// Startup-operation snapshot, for startup-path events.
    pub startup_operation: Option<StartupOperation>,
    /// Arbitrary extra fields.
    pub data: Option<serde_json::Value>,
}

/// Delivers a signed webhook to one URL, retrying transient failures.
pub struct WebhookClient {
    client: reqwest::Client,
}

impl Default for WebhookClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookClient {
    /// Build a client with the fixed per-request timeout.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builder"),
        }
    }

    /// Sign and POST `payload` to `url`, retrying up to [`MAX_ATTEMPTS`]
    /// times with jittered exponential backoff. 4xx responses are treated
    /// as non-retryable (the receiver rejected the request outright).
    #[tracing::instrument(skip(self, secret, payload), fields(url = %url))]
    pub async fn deliver(
        &self,
        url: &str,
        secret: &str,
        payload: &WebhookPayload,
    ) -> Result<(), CoreError> {
        let body = serde_json::to_vec(payload).map_err(|err| CoreError::WebhookDeliveryFailed {
            url: url.to_string(),
            reason: format!("failed to serialize payload: {err}"),
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(url, secret, &body).await {
                Ok(()) => return Ok(()),
                Err(DeliveryError::ClientRejected(reason)) => {
                    return Err(CoreError::WebhookDeliveryFailed {
                        url: url.to_string(),
                        reason,
                    });
                }
                Err(DeliveryError::Transient(reason)) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(CoreError::WebhookDeliveryFailed {
                            url: url.to_string(),
                            reason,
                        });
                    }
                    let delay = backoff_delay(BACKOFF_BASE, attempt).min(BACKOFF_CAP);
                    warn!(attempt, %reason, delay_ms = delay.as_millis() as u64, "webhook delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(&self, url: &str, secret: &str, body: &[u8]) -> Result<(), DeliveryError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign(secret, body);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", format!("sha256={signature}"))
            .header("X-Webhook-Timestamp", timestamp)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|err| DeliveryError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(DeliveryError::ClientRejected(format!(
                "receiver rejected delivery with status {status}"
            )))
        } else {
            Err(DeliveryError::Transient(format!(
                "receiver returned status {status}"
            )))
        }
    }
}

enum DeliveryError {
    /// 4xx: the receiver actively rejected this request body/signature.
    ClientRejected(String),
    /// Network error or 5xx: worth retrying.
    Transient(String),
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> WebhookPayload {
        WebhookPayload {
            instance_id: "inst-1".to_string(),
            upstream_id: Some("up-1".to_string()),
            status: "stopped".to_string(),
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delivers_with_signature_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("X-Webhook-Signature"))
            .and(header_exists("X-Webhook-Timestamp"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = WebhookClient::new();
        let result = client.deliver(&server.uri(), "secret", &payload()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = WebhookClient::new();
        let result = client.deliver(&server.uri(), "secret", &payload()).await;
        assert!(matches!(result, Err(CoreError::WebhookDeliveryFailed { .. })));
    }

    #[test]
    fn signature_is_hmac_sha256_of_the_body_alone() {
        let body = serde_json::to_vec(&payload()).unwrap();
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(&body);
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(sign("secret", &body), expected);
    }
}
