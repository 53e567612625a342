//! Error types for the NGX cache engine
//!
//! Provides structured error types for the cache tiers, the remote L2
//! backend, the monitoring surface and the content generation clients.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Entry too large for key {key}: {size} bytes exceeds every tier budget ({capacity} bytes)")]
    EntryTooLarge { key: String, size: u64, capacity: u64 },

    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Compression failed ({algorithm}): {reason}")]
    Compression { algorithm: String, reason: String },

    #[error("Decompression failed ({algorithm}): {reason}")]
    Decompression { algorithm: String, reason: String },

    // =========================================================================
    // Upstream Errors
    // =========================================================================
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Remote tier unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    #[error("Upstream error: {service} - {reason}")]
    Upstream { service: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The requested item does not exist
    NotFound,
    /// A collaborator (Redis, Vertex AI) failed
    UpstreamError,
    /// Caller supplied invalid input or configuration
    ValidationError,
    /// An operation exceeded its deadline
    Timeout,
    /// Bug or unexpected state inside the engine
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::UpstreamError => write!(f, "upstream_error"),
            ErrorKind::ValidationError => write!(f, "validation_error"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,

            Error::Redis(_)
            | Error::RemoteUnavailable { .. }
            | Error::Upstream { .. }
            | Error::Http(_) => ErrorKind::UpstreamError,

            Error::Timeout { .. } => ErrorKind::Timeout,

            Error::Configuration(_)
            | Error::Validation(_)
            | Error::InvalidPattern { .. }
            | Error::EntryTooLarge { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorKind::ValidationError,

            Error::Internal(_)
            | Error::Compression { .. }
            | Error::Decompression { .. }
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::UpstreamError | ErrorKind::Timeout)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Redis(_) | Error::RemoteUnavailable { .. } | Error::Timeout { .. }
        )
    }

    /// Build a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::NotFound { key: "vertex:a".into() };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let err = Error::Timeout {
            operation: "redis.get".into(),
            duration: Duration::from_millis(250),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = Error::Upstream {
            service: "vertex-ai".into(),
            reason: "503".into(),
        };
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::RemoteUnavailable {
            reason: "connection refused".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());

        let too_large = Error::EntryTooLarge {
            key: "k".into(),
            size: 10,
            capacity: 5,
        };
        assert!(!too_large.is_retryable());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::UpstreamError.to_string(), "upstream_error");
        assert_eq!(ErrorKind::ValidationError.to_string(), "validation_error");
    }
}
