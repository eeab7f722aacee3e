//! Transport boundary for remote ERP calls
//!
//! The runtime never executes HTTP itself. The embedding application
//! supplies a [`Transport`] and the orchestrator treats it as opaque,
//! inspecting only the classified error kind and HTTP-like status code.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::{ErrorClass, ErrorClassification, ErrorSeverity};

/// HTTP-like statuses that indicate a transient server-side condition.
///
/// 429 is deliberately absent: it is classified as [`ErrorClass::RateLimited`]
/// so the orchestrator can apply its floor delay.
pub const RETRYABLE_STATUSES: &[u16] = &[408, 502, 503, 504, 522, 524];

/// A request handed to the transport layer.
///
/// The runtime only needs a routing key (`operation`) for policy resolution
/// and logging; the payload passes through untouched.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransportRequest {
    /// Logical operation name, e.g. `"order.push"` or `"article.pull"`.
    pub operation: String,
    /// Opaque request payload.
    pub payload: Value,
}

impl TransportRequest {
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self { operation: operation.into(), payload }
    }
}

/// A response returned by the transport layer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransportResponse {
    /// HTTP-like status code.
    pub status: u16,
    /// Opaque response payload.
    pub payload: Value,
}

/// Failures the transport layer reports back to the runtime.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote did not answer within the deadline.
    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The connection could not be established or broke mid-flight.
    #[error("connection failure: {message}")]
    Connection { message: String },

    /// The remote answered with a non-success status. `retry_after` carries
    /// the server's Retry-After hint when the transport parsed one.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The response body could not be decoded.
    #[error("malformed response payload: {message}")]
    MalformedPayload { message: String },
}

impl TransportError {
    /// Convenience constructor for HTTP status failures.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http { status, message: message.into(), retry_after: None }
    }

    /// HTTP status failure carrying the server's Retry-After hint.
    pub fn http_with_retry_after(
        status: u16,
        message: impl Into<String>,
        retry_after: Duration,
    ) -> Self {
        Self::Http { status, message: message.into(), retry_after: Some(retry_after) }
    }

    /// Convenience constructor for connection failures.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// The HTTP status code, if this failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify this failure for retry and breaker decisions.
    ///
    /// Network-level failures and 5xx are retryable; 429 is rate-limited;
    /// the remaining 4xx and undecodable payloads are terminal. Anything
    /// the classification table does not recognize is treated as retryable,
    /// the safer default for an unreliable WAN link.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::Connection { .. } => ErrorClass::RetryableTransport,
            Self::MalformedPayload { .. } => ErrorClass::TerminalClient,
            Self::Http { status, .. } => classify_status(*status),
        }
    }
}

impl ErrorClassification for TransportError {
    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    fn severity(&self) -> ErrorSeverity {
        match self.class() {
            ErrorClass::RateLimited => ErrorSeverity::Warning,
            ErrorClass::TerminalClient => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classify an HTTP-like status code.
pub fn classify_status(status: u16) -> ErrorClass {
    if status == 429 {
        return ErrorClass::RateLimited;
    }
    if status >= 500 || RETRYABLE_STATUSES.contains(&status) {
        return ErrorClass::RetryableTransport;
    }
    if (400..500).contains(&status) {
        return ErrorClass::TerminalClient;
    }
    // Redirect/informational statuses surfacing as errors mean the transport
    // itself is confused; treat as transient.
    ErrorClass::RetryableTransport
}

/// The transport primitive supplied by the embedding application.
///
/// Implementations own HTTP verb execution, TLS, and session-bound
/// authentication. The runtime calls `execute` once per attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        (**self).execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates the status classification table.
    ///
    /// Assertions:
    /// - Confirms 5xx and the 408/502/503/504/522/524 set are retryable.
    /// - Confirms 429 maps to `RateLimited`.
    /// - Confirms remaining 4xx are terminal.
    #[test]
    fn test_classify_status_table() {
        for status in [500, 501, 503, 599, 408, 502, 504, 522, 524] {
            assert_eq!(
                classify_status(status),
                ErrorClass::RetryableTransport,
                "status {status} should be retryable"
            );
        }

        assert_eq!(classify_status(429), ErrorClass::RateLimited);

        for status in [400, 401, 403, 404, 409, 410, 422] {
            assert_eq!(
                classify_status(status),
                ErrorClass::TerminalClient,
                "status {status} should be terminal"
            );
        }
    }

    #[test]
    fn test_network_failures_are_retryable() {
        let timeout = TransportError::Timeout { elapsed_ms: 30_000 };
        assert_eq!(timeout.class(), ErrorClass::RetryableTransport);
        assert!(timeout.is_retryable());

        let conn = TransportError::connection("connection refused");
        assert_eq!(conn.class(), ErrorClass::RetryableTransport);
    }

    #[test]
    fn test_malformed_payload_is_terminal() {
        let err = TransportError::MalformedPayload { message: "unexpected EOF".into() };
        assert_eq!(err.class(), ErrorClass::TerminalClient);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(TransportError::http(503, "unavailable").status(), Some(503));
        assert_eq!(TransportError::Timeout { elapsed_ms: 10 }.status(), None);
    }

    /// The Retry-After hint rides on HTTP failures only; other variants
    /// report none.
    #[test]
    fn test_retry_after_hint_carried_on_http_errors() {
        let throttled = TransportError::http_with_retry_after(
            429,
            "too many requests",
            Duration::from_secs(45),
        );
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(45)));
        assert_eq!(throttled.class(), ErrorClass::RateLimited);

        assert_eq!(TransportError::http(429, "too many requests").retry_after(), None);
        assert_eq!(TransportError::connection("refused").retry_after(), None);
    }

    #[test]
    fn test_request_construction() {
        let req = TransportRequest::new("order.push", serde_json::json!({"id": 7}));
        assert_eq!(req.operation, "order.push");
        assert_eq!(req.payload["id"], 7);
    }
}
