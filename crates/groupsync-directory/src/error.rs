//! Directory service error types
//!
//! Error definitions with transient/permanent classification for retry logic.

use thiserror::Error;

use crate::ids::DirectoryId;

/// Error that can occur during directory service calls.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Transient errors (retried)
    /// The service rejected the call because the call budget is exhausted.
    #[error("rate limited by directory service (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// The directory is temporarily unavailable.
    #[error("directory {directory} unavailable: {message}")]
    Unavailable {
        directory: DirectoryId,
        message: String,
    },

    /// Network error during communication.
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The call did not complete in time.
    #[error("directory call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    // Permanent errors
    /// The requested entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The service refused the operation.
    #[error("forbidden: insufficient permissions for {operation} in directory {directory}")]
    Forbidden {
        operation: String,
        directory: DirectoryId,
    },

    /// The request was malformed.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The operation failed for another reason.
    #[error("operation failed: {message}")]
    OperationFailed { message: String },
}

impl DirectoryError {
    /// Create a not found error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(directory: DirectoryId, message: impl Into<String>) -> Self {
        Self::Unavailable {
            directory,
            message: message.into(),
        }
    }

    /// Create a network error without a source.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a forbidden error.
    pub fn forbidden(operation: impl Into<String>, directory: DirectoryId) -> Self {
        Self::Forbidden {
            operation: operation.into(),
            directory,
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Check if this error is transient and the call may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::RateLimited { .. }
                | DirectoryError::Unavailable { .. }
                | DirectoryError::Network { .. }
                | DirectoryError::Timeout { .. }
        )
    }

    /// Check if this error means the target no longer exists.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NotFound { .. })
    }

    /// Get a short error code for structured logs.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::RateLimited { .. } => "RATE_LIMITED",
            DirectoryError::Unavailable { .. } => "UNAVAILABLE",
            DirectoryError::Network { .. } => "NETWORK_ERROR",
            DirectoryError::Timeout { .. } => "TIMEOUT",
            DirectoryError::NotFound { .. } => "NOT_FOUND",
            DirectoryError::Forbidden { .. } => "FORBIDDEN",
            DirectoryError::InvalidRequest { .. } => "INVALID_REQUEST",
            DirectoryError::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }
}

/// Result type for directory service calls.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
