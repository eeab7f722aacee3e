//! Error taxonomy for the resilience runtime
//!
//! The runtime distinguishes errors by what a caller may do next, not by
//! where they came from:
//!
//! | Class | Meaning | Retried? |
//! |-------|---------|----------|
//! | `RetryableTransport` | timeouts, connection failures, 5xx, 408/502/503/504/522/524 | yes |
//! | `RateLimited` | HTTP 429 | yes, with a floor delay |
//! | `TerminalClient` | other 4xx, malformed payloads | never |
//! | `CircuitOpen` | breaker rejected the call before transport | no attempt made |
//! | `MemoryPressure` | cooperative abort, partial progress preserved | caller decides |
//! | `Configuration` | invalid tunables; resolution degrades to defaults | n/a |
//!
//! Infrastructure failures (persistence flush, missing policy config) are
//! absorbed and logged rather than propagated: resilience must not become
//! a new failure point for the domain operation it protects.

use std::time::Duration;

use thiserror::Error;

use crate::governor::MemoryPressure;
use crate::transport::TransportError;

/// Coarse classification of an error, driving retry and breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Transient transport or server-health failure; safe to retry.
    RetryableTransport,
    /// HTTP 429; retryable with a courtesy floor delay.
    RateLimited,
    /// Client-side error the remote will never accept; retrying is futile.
    TerminalClient,
    /// The circuit breaker rejected the call without attempting transport.
    CircuitOpen,
    /// Cooperative abort due to memory pressure.
    MemoryPressure,
    /// The caller cancelled the operation.
    Cancelled,
    /// Invalid configuration values.
    Configuration,
}

impl ErrorClass {
    /// Whether the orchestrator may schedule another attempt for this class.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableTransport | Self::RateLimited)
    }

    /// Whether a failure of this class counts toward circuit breaker state.
    ///
    /// Only transport/server-health failures count; a 404 says nothing
    /// about whether the remote service is healthy.
    pub fn counts_toward_breaker(self) -> bool {
        matches!(self, Self::RetryableTransport | Self::RateLimited)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::RetryableTransport => "retryable_transport",
            Self::RateLimited => "rate_limited",
            Self::TerminalClient => "terminal_client",
            Self::CircuitOpen => "circuit_open",
            Self::MemoryPressure => "memory_pressure",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
        };
        write!(f, "{label}")
    }
}

/// Severity levels for monitoring and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, expected conditions.
    Info,
    /// Degraded but operational.
    Warning,
    /// Failure requiring attention.
    Error,
    /// System integrity at risk.
    Critical,
}

/// Standard interface for classifying errors by their characteristics.
///
/// Implemented by every error type the runtime produces so that callers
/// can branch on retryability without matching concrete variants.
pub trait ErrorClassification {
    /// Can the operation that produced this error be retried?
    fn is_retryable(&self) -> bool;

    /// How serious is this error?
    fn severity(&self) -> ErrorSeverity;

    /// Suggested delay before the next attempt, if the error carries one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Terminal outcome of a resilience-wrapped call.
///
/// Callers always receive one of: a successful result, a terminal error
/// with classification, or an aborted-with-partial-progress outcome.
/// Never a silent hang.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Circuit breaker is open; the call was rejected without a transport
    /// attempt.
    #[error("circuit open for endpoint '{endpoint}', retry in {retry_after:?}")]
    CircuitOpen { endpoint: String, retry_after: Option<Duration> },

    /// Every allowed attempt failed with a retryable error.
    #[error("retry attempts exhausted after {attempts} tries")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The remote rejected the request in a way retrying cannot fix.
    #[error("terminal failure: {source}")]
    Terminal {
        #[source]
        source: TransportError,
    },

    /// Cooperative abort triggered by memory pressure. Carries the progress
    /// counters so callers can surface "aborted, partial results attached".
    #[error("aborted at memory pressure {level} after {items_completed} items")]
    MemoryPressureAbort { level: MemoryPressure, items_completed: u64 },

    /// The caller cancelled a pending retry delay.
    #[error("operation '{operation}' cancelled during retry backoff")]
    Cancelled { operation: String },

    /// Invalid configuration values supplied at construction time.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
}

impl SyncError {
    /// The classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            Self::RetryExhausted { source, .. } => source.class(),
            Self::Terminal { .. } => ErrorClass::TerminalClient,
            Self::MemoryPressureAbort { .. } => ErrorClass::MemoryPressure,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::Configuration { .. } => ErrorClass::Configuration,
        }
    }

    /// Convenience constructor for configuration failures.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl ErrorClassification for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            // The breaker will eventually admit traffic again; retrying the
            // whole logical call later is meaningful.
            Self::CircuitOpen { .. } => true,
            Self::RetryExhausted { .. } => false,
            Self::Terminal { .. } => false,
            Self::MemoryPressureAbort { .. } => true,
            Self::Cancelled { .. } => false,
            Self::Configuration { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen { .. } => ErrorSeverity::Warning,
            Self::RetryExhausted { .. } => ErrorSeverity::Error,
            Self::Terminal { .. } => ErrorSeverity::Error,
            Self::MemoryPressureAbort { .. } => ErrorSeverity::Warning,
            Self::Cancelled { .. } => ErrorSeverity::Info,
            Self::Configuration { .. } => ErrorSeverity::Error,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result alias for runtime operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Simple configuration error used by builders during validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid { message } => SyncError::Configuration { message },
        }
    }
}

/// Result alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    /// Validates retryability across the error classes.
    ///
    /// Assertions:
    /// - Ensures `RetryableTransport` and `RateLimited` are retryable.
    /// - Ensures `TerminalClient` and `Configuration` are not.
    #[test]
    fn test_error_class_retryability() {
        assert!(ErrorClass::RetryableTransport.is_retryable());
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(!ErrorClass::TerminalClient.is_retryable());
        assert!(!ErrorClass::CircuitOpen.is_retryable());
        assert!(!ErrorClass::Configuration.is_retryable());
    }

    /// Only server-health failures move the breaker; client errors do not.
    #[test]
    fn test_breaker_accounting_excludes_client_errors() {
        assert!(ErrorClass::RetryableTransport.counts_toward_breaker());
        assert!(ErrorClass::RateLimited.counts_toward_breaker());
        assert!(!ErrorClass::TerminalClient.counts_toward_breaker());
        assert!(!ErrorClass::CircuitOpen.counts_toward_breaker());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
    }

    #[test]
    fn test_sync_error_class_mapping() {
        let open = SyncError::CircuitOpen { endpoint: "erp".into(), retry_after: None };
        assert_eq!(open.class(), ErrorClass::CircuitOpen);

        let terminal = SyncError::Terminal { source: TransportError::http(404, "not found") };
        assert_eq!(terminal.class(), ErrorClass::TerminalClient);
        assert!(!terminal.is_retryable());

        let config = SyncError::config("maxAttempts must be positive");
        assert_eq!(config.class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_retry_exhausted_inherits_source_class() {
        let exhausted = SyncError::RetryExhausted {
            attempts: 3,
            source: TransportError::http(503, "service unavailable"),
        };
        assert_eq!(exhausted.class(), ErrorClass::RetryableTransport);
        // Exhaustion itself is final even though the source was retryable.
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn test_circuit_open_carries_retry_after() {
        let err = SyncError::CircuitOpen {
            endpoint: "erp".into(),
            retry_after: Some(Duration::from_secs(42)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(err.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_display_messages() {
        let err = SyncError::RetryExhausted {
            attempts: 5,
            source: TransportError::http(500, "boom"),
        };
        assert!(err.to_string().contains("5 tries"));

        let err = ConfigError::invalid("bad ratio");
        assert!(err.to_string().contains("bad ratio"));
    }
}
