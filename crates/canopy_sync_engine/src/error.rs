//! Error types for the client engine.

use canopy_core::CoreError;
use canopy_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the client engine.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Local validation or cache error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The server's rules refused the operation.
    #[error("permission denied at {path}")]
    PermissionDenied {
        /// Location of the refused operation.
        path: String,
    },

    /// The operation needs a connection and there is none.
    #[error("not connected to server")]
    Disconnected,

    /// A conditional write found a different server value.
    #[error("data at {path} changed on the server")]
    DataStale {
        /// Location of the write.
        path: String,
    },

    /// A transaction kept losing races.
    #[error("transaction gave up after {attempts} attempts")]
    MaxRetriesExceeded {
        /// Attempts made.
        attempts: u32,
    },

    /// A transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Why it stopped.
        reason: String,
    },

    /// A queued disconnect action was cancelled before it ran.
    #[error("disconnect action at {path} was cancelled")]
    Cancelled {
        /// Location of the action.
        path: String,
    },

    /// The database was deleted.
    #[error("database has been deleted")]
    DatabaseDeleted,

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server rejected the request.
    #[error("server error: {0}")]
    ServerError(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Disconnected | SyncError::DataStale { .. } => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true for rejected arguments, paths and values.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, SyncError::Core(e) if e.is_validation())
    }

    /// Returns true when security rules refused the operation.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            SyncError::PermissionDenied { .. } | SyncError::Core(CoreError::PermissionDenied { .. })
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}
