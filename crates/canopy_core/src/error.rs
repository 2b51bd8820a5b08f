//! Error types for canopy core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in canopy core operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A path segment or child key is malformed.
    #[error("invalid path segment {segment:?}: {reason}")]
    InvalidPathSegment {
        /// The offending segment.
        segment: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An argument was rejected during validation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The server revoked a listener's access mid-stream.
    #[error("listener at {path} cancelled: {reason}")]
    StaleListenerCancelled {
        /// Path of the cancelled query.
        path: String,
        /// Reason given by the server.
        reason: String,
    },

    /// The server refused access to a location.
    #[error("permission denied at {path}")]
    PermissionDenied {
        /// Location that was refused.
        path: String,
    },

    /// The persistence collaborator failed.
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid path segment error.
    pub fn invalid_segment(segment: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPathSegment {
            segment: segment.into(),
            reason,
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Returns true for errors raised by local validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidPathSegment { .. } | CoreError::InvalidArgument { .. }
        )
    }
}
