//! Protocol messages.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Opens a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client chosen session identifier.
    pub session_id: String,
    /// Credential from the auth collaborator, if any.
    pub auth_token: Option<String>,
    /// Protocol version.
    pub protocol_version: u16,
}

impl HandshakeRequest {
    /// Creates a handshake request.
    pub fn new(session_id: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            auth_token,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Server answer to a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether the session was opened.
    pub success: bool,
    /// Error message if refused.
    pub error: Option<String>,
    /// Server protocol version.
    pub protocol_version: u16,
    /// Server clock in milliseconds since the Unix epoch.
    pub server_time: i64,
}

impl HandshakeResponse {
    /// Creates a successful response.
    pub fn success(server_time: i64) -> Self {
        Self {
            success: true,
            error: None,
            protocol_version: PROTOCOL_VERSION,
            server_time,
        }
    }

    /// Creates a refusal.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            protocol_version: PROTOCOL_VERSION,
            server_time: 0,
        }
    }
}

/// Intent sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Subscribe to a location. The server answers with `Data`, then `Ack`.
    Listen {
        /// Correlates the acknowledgment.
        request_id: u64,
        /// Location.
        path: String,
        /// Query identifier, `"default"` for the whole location.
        query: String,
    },
    /// Stop a subscription.
    Unlisten {
        /// Location.
        path: String,
        /// Query identifier.
        query: String,
    },
    /// Replace the value at a location.
    Put {
        /// Correlates the acknowledgment.
        request_id: u64,
        /// Location.
        path: String,
        /// New value in exported form.
        data: Json,
        /// If set, the write applies only when the current value hashes to
        /// this (empty for null).
        hash: Option<String>,
    },
    /// Replace several descendants. Keys of `data` are relative paths.
    Merge {
        /// Correlates the acknowledgment.
        request_id: u64,
        /// Location.
        path: String,
        /// Relative path to value.
        data: Json,
    },
    /// Queue a put to run when the session ends.
    OnDisconnectPut {
        /// Correlates the acknowledgment.
        request_id: u64,
        /// Location.
        path: String,
        /// Value to write.
        data: Json,
    },
    /// Queue a merge to run when the session ends.
    OnDisconnectMerge {
        /// Correlates the acknowledgment.
        request_id: u64,
        /// Location.
        path: String,
        /// Relative path to value.
        data: Json,
    },
    /// Drop queued disconnect actions at and beneath a location.
    OnDisconnectCancel {
        /// Correlates the acknowledgment.
        request_id: u64,
        /// Location.
        path: String,
    },
}

impl ClientMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            ClientMessage::Listen { .. } => 1,
            ClientMessage::Unlisten { .. } => 2,
            ClientMessage::Put { .. } => 3,
            ClientMessage::Merge { .. } => 4,
            ClientMessage::OnDisconnectPut { .. } => 5,
            ClientMessage::OnDisconnectMerge { .. } => 6,
            ClientMessage::OnDisconnectCancel { .. } => 7,
        }
    }

    /// Request id awaiting an acknowledgment, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::Listen { request_id, .. }
            | ClientMessage::Put { request_id, .. }
            | ClientMessage::Merge { request_id, .. }
            | ClientMessage::OnDisconnectPut { request_id, .. }
            | ClientMessage::OnDisconnectMerge { request_id, .. }
            | ClientMessage::OnDisconnectCancel { request_id, .. } => Some(*request_id),
            ClientMessage::Unlisten { .. } => None,
        }
    }

    /// Target location.
    pub fn path(&self) -> &str {
        match self {
            ClientMessage::Listen { path, .. }
            | ClientMessage::Unlisten { path, .. }
            | ClientMessage::Put { path, .. }
            | ClientMessage::Merge { path, .. }
            | ClientMessage::OnDisconnectPut { path, .. }
            | ClientMessage::OnDisconnectMerge { path, .. }
            | ClientMessage::OnDisconnectCancel { path, .. } => path,
        }
    }

    /// True for messages that change data immediately.
    pub fn is_write(&self) -> bool {
        matches!(self, ClientMessage::Put { .. } | ClientMessage::Merge { .. })
    }
}

/// Result of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AckStatus {
    /// The request succeeded.
    Ok,
    /// A conditional put found a different value. `current` is the value
    /// the server holds.
    DataStale {
        /// Current server value in exported form.
        current: Json,
    },
    /// Security rules refused the request.
    PermissionDenied,
    /// Any other failure.
    Error {
        /// Description.
        message: String,
    },
}

impl AckStatus {
    /// True for [`AckStatus::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, AckStatus::Ok)
    }
}

/// Message pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Completes a request.
    Ack {
        /// Request being acknowledged.
        request_id: u64,
        /// Outcome.
        status: AckStatus,
    },
    /// New server state for a location.
    Data {
        /// Location.
        path: String,
        /// Value in exported form. For merges, keys are relative paths.
        data: Json,
        /// Whether `data` is a merge.
        merge: bool,
    },
    /// A listen lost access.
    ListenRevoked {
        /// Location.
        path: String,
        /// Query identifier.
        query: String,
        /// Why access was lost.
        reason: String,
    },
    /// The session credential is no longer valid.
    AuthRevoked {
        /// Why it was revoked.
        reason: String,
    },
}

impl ServerMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            ServerMessage::Ack { .. } => 64,
            ServerMessage::Data { .. } => 65,
            ServerMessage::ListenRevoked { .. } => 66,
            ServerMessage::AuthRevoked { .. } => 67,
        }
    }

    /// Creates a successful acknowledgment.
    pub fn ok(request_id: u64) -> Self {
        ServerMessage::Ack {
            request_id,
            status: AckStatus::Ok,
        }
    }
}
