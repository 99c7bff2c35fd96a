//! Service and transport error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for service calls.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error codes reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Entity or item does not exist.
    NotFound,
    /// Unique name already taken.
    AlreadyExists,
    /// Caller lacks access to the target.
    PermissionDenied,
    /// Conditional write lost against a newer revision.
    RevisionConflict,
    /// Too many requests.
    RateLimited,
    /// Malformed or inconsistent request.
    InvalidRequest,
    /// Token missing, malformed or rejected.
    Unauthorized,
    /// Token was valid but has expired.
    TokenExpired,
    /// Protocol version not supported.
    UnsupportedVersion,
    /// Unclassified service failure.
    Internal,
}

impl ErrorCode {
    /// Returns the HTTP-style status associated with this code.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::InvalidRequest => 400,
            ErrorCode::Unauthorized | ErrorCode::TokenExpired => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists => 409,
            ErrorCode::RevisionConflict => 412,
            ErrorCode::UnsupportedVersion => 426,
            ErrorCode::RateLimited => 429,
            ErrorCode::Internal => 500,
        }
    }

    /// Returns the numeric code used in error reports.
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::InvalidRequest => 54_001,
            ErrorCode::Unauthorized => 20_101,
            ErrorCode::TokenExpired => 20_104,
            ErrorCode::PermissionDenied => 54_007,
            ErrorCode::NotFound => 54_100,
            ErrorCode::AlreadyExists => 54_301,
            ErrorCode::RevisionConflict => 54_103,
            ErrorCode::UnsupportedVersion => 54_500,
            ErrorCode::RateLimited => 54_009,
            ErrorCode::Internal => 54_000,
        }
    }

    /// Returns true for credential problems.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ErrorCode::Unauthorized | ErrorCode::TokenExpired)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// An error reported by the service for one request.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ServiceError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServiceError {
    /// Creates a service error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Creates an invalid-request error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

/// Errors surfaced by a [`Transport`](crate::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is down; the request never reached the service.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The transport was closed.
    #[error("transport closed")]
    Closed,

    /// The service processed the request and rejected it.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl TransportError {
    /// Returns the service error code, if the service answered.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransportError::Service(err) => Some(err.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::NotFound.status(), 404);
        assert_eq!(ErrorCode::RevisionConflict.status(), 412);
        assert_eq!(ErrorCode::RateLimited.status(), 429);
        assert!(ErrorCode::TokenExpired.is_auth_failure());
        assert!(!ErrorCode::NotFound.is_auth_failure());
    }

    #[test]
    fn error_display() {
        let err = ServiceError::not_found("no such map");
        let msg = err.to_string();
        assert!(msg.contains("NotFound"));
        assert!(msg.contains("no such map"));
    }

    #[test]
    fn transport_error_code() {
        let err = TransportError::from(ServiceError::invalid("bad"));
        assert_eq!(err.code(), Some(ErrorCode::InvalidRequest));
        assert_eq!(TransportError::Closed.code(), None);
    }
}
