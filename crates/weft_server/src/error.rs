//! Error types for the reference service.

use thiserror::Error;
use weft_protocol::{EntityId, EntityKind, ErrorCode, ItemKey, Revision, ServiceError};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the reference service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The session token has expired.
    #[error("token expired")]
    TokenExpired,

    /// Authorization failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Entity does not exist.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Item does not exist.
    #[error("item {key} not found in {entity}")]
    ItemNotFound {
        /// Collection that was searched.
        entity: EntityId,
        /// Missing item.
        key: ItemKey,
    },

    /// Unique name already taken.
    #[error("{kind} named {name:?} already exists")]
    NameTaken {
        /// Entity kind.
        kind: EntityKind,
        /// Requested name.
        name: String,
    },

    /// Conditional write lost.
    #[error("revision conflict: expected {expected:?}, current {current:?}")]
    RevisionConflict {
        /// Revision the writer expected.
        expected: Option<Revision>,
        /// Revision currently stored.
        current: Option<Revision>,
    },

    /// Too many publishes.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Unknown session.
    #[error("no active session")]
    NoSession,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns the protocol error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ServerError::AuthenticationFailed(_) | ServerError::NoSession => {
                ErrorCode::Unauthorized
            }
            ServerError::TokenExpired => ErrorCode::TokenExpired,
            ServerError::NotAuthorized(_) => ErrorCode::PermissionDenied,
            ServerError::EntityNotFound(_) | ServerError::ItemNotFound { .. } => {
                ErrorCode::NotFound
            }
            ServerError::NameTaken { .. } => ErrorCode::AlreadyExists,
            ServerError::RevisionConflict { .. } => ErrorCode::RevisionConflict,
            ServerError::RateLimited(_) => ErrorCode::RateLimited,
            ServerError::ProtocolMismatch(_) => ErrorCode::UnsupportedVersion,
            ServerError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        self.code().status() < 500
    }
}

impl From<ServerError> for ServiceError {
    fn from(err: ServerError) -> Self {
        ServiceError::new(err.code(), err.to_string())
    }
}
