//! Error types for the reference server.

use canopy_core::CoreError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the reference server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Token rejected.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Rules refused access to a location.
    #[error("permission denied at {0}")]
    PermissionDenied(String),

    /// No session with this id.
    #[error("unknown session: {0}")]
    UnknownSession(u64),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Value or path rejected by the tree model.
    #[error("data error: {0}")]
    Core(#[from] CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::PermissionDenied(_)
                | ServerError::UnknownSession(_)
                | ServerError::ProtocolMismatch(_)
                | ServerError::Core(_)
        )
    }

    /// Returns true if this is a server error.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }
}
