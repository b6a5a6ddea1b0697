/// Unified error handling for the puente access layer
///
/// Errors fall into five families: fatal configuration errors, domain errors
/// raised by the application (never retried), transient backend errors,
/// synthetic circuit-open rejections, and exhausted retry budgets. Every
/// variant carries enough context for the caller to log without re-deriving
/// pool or breaker state.

use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::resilience::breaker::CircuitState;

/// Main error type for puente operations
#[derive(Debug, Error)]
pub enum PuenteError {
    /// The logical connection id is not present in static configuration
    #[error("Configuration not found for connection: {connection_id}")]
    ConfigNotFound { connection_id: String },

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Unknown failover group
    #[error("Connection group not found: {group_id}")]
    GroupNotFound { group_id: String },

    /// Rejected by the circuit breaker without reaching the backend
    #[error(
        "Circuit breaker is {state} for connection {connection_id}, retry in {}ms",
        .remaining.as_millis()
    )]
    CircuitOpen {
        connection_id: String,
        state: CircuitState,
        opened_at: SystemTime,
        remaining: Duration,
    },

    /// Retry budget spent; wraps the last transient cause
    #[error(
        "Max retries exceeded for {connection_id} after {attempts} attempts ({}ms): {source}",
        .elapsed.as_millis()
    )]
    MaxRetriesExceeded {
        connection_id: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<PuenteError>,
    },

    /// No healthy region left in a failover group
    #[error("All regions failed for group: {group_id}")]
    AllRegionsFailed { group_id: String },

    /// Error reported by a backend driver or the network underneath it
    #[error("Backend error on {connection_id}: {message}")]
    Backend {
        connection_id: String,
        code: Option<String>,
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Query issued against a connection that was already closed
    #[error("Connection closed: {connection_id}")]
    Closed { connection_id: String },

    /// Domain error: invalid input
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Domain error: the requested entity does not exist
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Domain error: caller is not allowed to perform the operation
    #[error("Authorization error: {message}")]
    Authorization { message: String },

    /// Domain error: a business rule rejected the operation
    #[error("Business rule violation: {message}")]
    BusinessRule { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for puente operations
pub type PuenteResult<T> = Result<T, PuenteError>;

/// Convenience methods for creating specific error types
impl PuenteError {
    /// Create a backend error with an optional driver/network code
    pub fn backend(
        connection_id: impl Into<String>,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        PuenteError::Backend {
            connection_id: connection_id.into(),
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// Create a configuration-not-found error
    pub fn config_not_found<S: Into<String>>(connection_id: S) -> Self {
        PuenteError::ConfigNotFound {
            connection_id: connection_id.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        PuenteError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        PuenteError::Validation {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PuenteError::Internal {
            message: message.into(),
        }
    }

    /// Driver or network error code, when one is known
    pub fn code(&self) -> Option<&str> {
        match self {
            PuenteError::Backend { code, .. } => code.as_deref(),
            PuenteError::Timeout { .. } => Some("ETIMEDOUT"),
            _ => None,
        }
    }

    /// The error's own text, without the connection id or other context
    pub fn detail(&self) -> Option<&str> {
        match self {
            PuenteError::Backend { message, .. } => Some(message),
            PuenteError::Timeout { operation } => Some(operation),
            _ => None,
        }
    }

    /// Logical connection id the error refers to, when one is known
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            PuenteError::ConfigNotFound { connection_id }
            | PuenteError::CircuitOpen { connection_id, .. }
            | PuenteError::MaxRetriesExceeded { connection_id, .. }
            | PuenteError::Backend { connection_id, .. }
            | PuenteError::Closed { connection_id } => Some(connection_id),
            _ => None,
        }
    }

    /// Errors raised by the application's own rules; never retried
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            PuenteError::Validation { .. }
                | PuenteError::NotFound { .. }
                | PuenteError::Authorization { .. }
                | PuenteError::BusinessRule { .. }
        )
    }

    /// Errors no amount of retrying or failover can fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PuenteError::ConfigNotFound { .. }
                | PuenteError::Config(_)
                | PuenteError::GroupNotFound { .. }
        )
    }

    /// Check if this error is recoverable by trying again elsewhere or later
    pub fn is_recoverable(&self) -> bool {
        match self {
            PuenteError::Backend { .. } => true,
            PuenteError::Timeout { .. } => true,
            PuenteError::Closed { .. } => true,
            PuenteError::CircuitOpen { .. } => true,
            PuenteError::MaxRetriesExceeded { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PuenteError::Config(_) => ErrorSeverity::Critical,
            PuenteError::ConfigNotFound { .. } => ErrorSeverity::Critical,
            PuenteError::Internal { .. } => ErrorSeverity::Critical,
            PuenteError::AllRegionsFailed { .. } => ErrorSeverity::Critical,
            PuenteError::Backend { .. } => ErrorSeverity::Warning,
            PuenteError::Timeout { .. } => ErrorSeverity::Warning,
            PuenteError::CircuitOpen { .. } => ErrorSeverity::Warning,
            _ if self.is_domain() => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = PuenteError::backend("erp-prod", Some("08S01"), "Communication link failure");
        assert!(matches!(error, PuenteError::Backend { .. }));
        assert_eq!(
            error.to_string(),
            "Backend error on erp-prod: Communication link failure"
        );
        assert_eq!(error.code(), Some("08S01"));
        assert_eq!(error.connection_id(), Some("erp-prod"));
    }

    #[test]
    fn test_error_severity() {
        let config_error = PuenteError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let backend_error = PuenteError::backend("erp", None, "reset");
        assert_eq!(backend_error.severity(), ErrorSeverity::Warning);

        let domain_error = PuenteError::validation("bad code");
        assert_eq!(domain_error.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_error_recoverability() {
        let backend_error = PuenteError::backend("erp", Some("ECONNREFUSED"), "refused");
        assert!(backend_error.is_recoverable());

        let missing = PuenteError::config_not_found("nope");
        assert!(!missing.is_recoverable());
        assert!(missing.is_fatal());

        let domain = PuenteError::NotFound {
            message: "item 42".to_string(),
        };
        assert!(domain.is_domain());
        assert!(!domain.is_recoverable());
    }

    #[test]
    fn test_exhausted_error_keeps_cause() {
        let error = PuenteError::MaxRetriesExceeded {
            connection_id: "erp".to_string(),
            attempts: 3,
            elapsed: Duration::from_millis(1500),
            source: Box::new(PuenteError::timeout("connect erp")),
        };

        let cause = std::error::Error::source(&error).unwrap();
        assert_eq!(cause.to_string(), "Operation timed out: connect erp");
        assert!(error.to_string().contains("after 3 attempts (1500ms)"));
    }

    #[test]
    fn test_circuit_open_message() {
        let error = PuenteError::CircuitOpen {
            connection_id: "erp".to_string(),
            state: CircuitState::Open,
            opened_at: SystemTime::now(),
            remaining: Duration::from_millis(2500),
        };
        assert_eq!(
            error.to_string(),
            "Circuit breaker is OPEN for connection erp, retry in 2500ms"
        );
    }
}
