// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unified error taxonomy for novita-core.
//!
//! Every error kind named in the specification's error-handling design maps
//! to one [`CoreError`] variant. Each variant carries a stable
//! [`CoreError::error_code`], an [`ErrorCategory`] (transient vs. permanent),
//! and a [`RetryHint`] so request handlers and job handlers can make
//! consistent retry/surface decisions from the same type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Whether an error is worth retrying automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retry is likely to succeed (network, timeout, rate limit, 5xx).
    Transient,
    /// Don't auto-retry (validation, not found, conflict, 4xx).
    #[default]
    Permanent,
}

/// Retry behavior hint attached to an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    /// Permanent error, do not retry.
    #[default]
    DoNotRetry,
    /// Retry with exponential backoff.
    RetryWithBackoff,
    /// Retry after the given duration (e.g. upstream `Retry-After`).
    RetryAfter(Duration),
}

impl RetryHint {
    /// Returns true if this hint indicates the caller should retry.
    pub fn should_retry(&self) -> bool {
        !matches!(self, RetryHint::DoNotRetry)
    }
}

/// Core errors that can occur anywhere in the control plane.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Inbound intent violates schema or an invariant.
    Validation {
        /// The field that failed validation.
        field: String,
        /// Human-readable reason.
        message: String,
    },
    /// Requested instance/product/template does not exist locally or upstream.
    NotFound {
        /// What kind of entity was missing ("instance", "product", ...).
        kind: String,
        /// The identifier that was looked up.
        id: String,
    },
    /// Intent is inapplicable to the entity's current state.
    Conflict {
        /// The instance id.
        instance_id: String,
        /// The state the intent required.
        expected: String,
        /// The state the instance is actually in.
        actual: String,
    },
    /// Upstream returned 4xx other than 429.
    UpstreamClient {
        /// HTTP status code.
        status: u16,
        /// Response body or message.
        message: String,
    },
    /// Upstream returned 429.
    UpstreamRateLimit {
        /// `Retry-After`, if the upstream provided one.
        retry_after: Option<Duration>,
    },
    /// Upstream returned 5xx.
    UpstreamServer {
        /// HTTP status code.
        status: u16,
        /// Response body or message.
        message: String,
    },
    /// Upstream connection failed or timed out.
    UpstreamTimeout {
        /// Which call timed out.
        operation: String,
    },
    /// A network-level failure (connection refused, DNS, reset).
    Network {
        /// Underlying message.
        message: String,
    },
    /// The circuit breaker is open and short-circuited the call.
    CircuitOpen {
        /// Which upstream category is open.
        category: String,
    },
    /// The persistent store is unreachable.
    StoreUnavailable {
        /// Underlying message.
        message: String,
    },
    /// All webhook delivery retries were exhausted.
    WebhookDeliveryFailed {
        /// Target URL.
        url: String,
        /// Last error observed.
        reason: String,
    },
    /// A job handler exceeded its timeout budget.
    JobTimeout {
        /// The job id.
        job_id: String,
        /// The configured timeout.
        timeout: Duration,
    },
    /// Store or cache operation failed for a reason other than
    /// unavailability (serialization, WRONGTYPE, etc).
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Stable machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::UpstreamClient { .. } => "UPSTREAM_CLIENT_ERROR",
            Self::UpstreamRateLimit { .. } => "UPSTREAM_RATE_LIMIT",
            Self::UpstreamServer { .. } => "UPSTREAM_SERVER_ERROR",
            Self::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            Self::Network { .. } => "NETWORK_ERROR",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::WebhookDeliveryFailed { .. } => "WEBHOOK_DELIVERY_FAILED",
            Self::JobTimeout { .. } => "JOB_TIMEOUT",
            Self::Store { .. } => "STORE_ERROR",
        }
    }

    /// Transient vs. permanent classification for retry routing.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::Conflict { .. }
            | Self::UpstreamClient { .. } => ErrorCategory::Permanent,
            Self::UpstreamRateLimit { .. }
            | Self::UpstreamServer { .. }
            | Self::UpstreamTimeout { .. }
            | Self::Network { .. }
            | Self::CircuitOpen { .. }
            | Self::StoreUnavailable { .. } => ErrorCategory::Transient,
            Self::WebhookDeliveryFailed { .. } | Self::JobTimeout { .. } | Self::Store { .. } => {
                ErrorCategory::Permanent
            }
        }
    }

    /// Retry hint for this error.
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            Self::UpstreamRateLimit { retry_after } => match retry_after {
                Some(d) => RetryHint::RetryAfter(*d),
                None => RetryHint::RetryWithBackoff,
            },
            Self::UpstreamServer { .. }
            | Self::UpstreamTimeout { .. }
            | Self::Network { .. }
            | Self::StoreUnavailable { .. } => RetryHint::RetryWithBackoff,
            _ => RetryHint::DoNotRetry,
        }
    }

    /// HTTP status code an inbound request handler should surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::UpstreamClient { status, .. } => *status,
            Self::UpstreamRateLimit { .. } => 429,
            Self::UpstreamServer { .. } => 502,
            Self::UpstreamTimeout { .. } | Self::Network { .. } => 504,
            Self::CircuitOpen { .. } => 503,
            Self::StoreUnavailable { .. } => 503,
            Self::WebhookDeliveryFailed { .. } | Self::JobTimeout { .. } | Self::Store { .. } => {
                500
            }
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { field, message } => {
                write!(f, "validation error for '{field}': {message}")
            }
            Self::NotFound { kind, id } => write!(f, "{kind} '{id}' not found"),
            Self::Conflict {
                instance_id,
                expected,
                actual,
            } => write!(
                f,
                "instance '{instance_id}' is in state '{actual}', expected '{expected}'"
            ),
            Self::UpstreamClient { status, message } => {
                write!(f, "upstream client error {status}: {message}")
            }
            Self::UpstreamRateLimit { retry_after } => {
                write!(f, "upstream rate limited, retry_after={retry_after:?}")
            }
            Self::UpstreamServer { status, message } => {
                write!(f, "upstream server error {status}: {message}")
            }
            Self::UpstreamTimeout { operation } => write!(f, "upstream timeout on {operation}"),
            Self::Network { message } => write!(f, "network error: {message}"),
            Self::CircuitOpen { category } => write!(f, "circuit open for {category}"),
            Self::StoreUnavailable { message } => write!(f, "store unavailable: {message}"),
            Self::WebhookDeliveryFailed { url, reason } => {
                write!(f, "webhook delivery to {url} failed: {reason}")
            }
            Self::JobTimeout { job_id, timeout } => {
                write!(f, "job '{job_id}' exceeded timeout {timeout:?}")
            }
            Self::Store { operation, details } => {
                write!(f, "store error during '{operation}': {details}")
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Store {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Error response body shape surfaced to inbound callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// When the error occurred.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Request correlation id.
    pub request_id: String,
}

impl CoreError {
    /// Render the caller-facing `{error: {...}}` envelope for this error.
    pub fn to_response(&self, request_id: impl Into<String>) -> ErrorResponse {
        ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
            details: None,
            timestamp: chrono::Utc::now(),
            request_id: request_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let cases = vec![
            (
                CoreError::NotFound {
                    kind: "instance".into(),
                    id: "inst-1".into(),
                },
                "NOT_FOUND",
            ),
            (
                CoreError::Conflict {
                    instance_id: "inst-1".into(),
                    expected: "running".into(),
                    actual: "stopped".into(),
                },
                "CONFLICT",
            ),
            (
                CoreError::UpstreamRateLimit {
                    retry_after: Some(Duration::from_secs(1)),
                },
                "UPSTREAM_RATE_LIMIT",
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code);
        }
    }

    #[test]
    fn retry_hints_match_category() {
        let err = CoreError::UpstreamServer {
            status: 503,
            message: "boom".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.retry_hint().should_retry());

        let err = CoreError::Validation {
            field: "name".into(),
            message: "required".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.retry_hint().should_retry());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            CoreError::NotFound {
                kind: "instance".into(),
                id: "x".into()
            }
            .http_status(),
            404
        );
        assert_eq!(
            CoreError::Conflict {
                instance_id: "x".into(),
                expected: "a".into(),
                actual: "b".into()
            }
            .http_status(),
            409
        );
        assert_eq!(
            CoreError::CircuitOpen {
                category: "create".into()
            }
            .http_status(),
            503
        );
    }
}
