//! Sync error types.

use groupsync_directory::error::DirectoryError;
use groupsync_directory::ids::{DirectoryId, GrantId};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Directory service error.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// The primary grant has no mapping. Callers treat this as a no-op.
    #[error("Grant {grant} has no group mapping")]
    UnknownGrant { grant: GrantId },

    /// Configuration error (fatal at startup).
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A submitted selection does not fit its selection set.
    #[error("Invalid selection: {message}")]
    InvalidSelection { message: String },

    /// Some entities of a batch or fan-out failed; the rest were processed.
    #[error("Partial failure in {context}: {failed} of {total} failed")]
    PartialFailure {
        context: String,
        failed: usize,
        total: usize,
    },

    /// A required directory could not be found.
    #[error("Directory {directory} not found")]
    DirectoryMissing { directory: DirectoryId },
}

impl SyncError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid selection error.
    pub fn invalid_selection(message: impl Into<String>) -> Self {
        Self::InvalidSelection {
            message: message.into(),
        }
    }

    /// Create a partial failure error.
    pub fn partial_failure(context: impl Into<String>, failed: usize, total: usize) -> Self {
        Self::PartialFailure {
            context: context.into(),
            failed,
            total,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Directory(e) => e.is_transient(),
            SyncError::PartialFailure { .. } => true,
            _ => false,
        }
    }

    /// Check if the error means the target is gone (skip, not fail).
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Directory(e) if e.is_not_found())
    }

    /// Check if the error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration { .. }
                | SyncError::DirectoryMissing { .. }
                | SyncError::Directory(DirectoryError::Forbidden { .. })
        )
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
