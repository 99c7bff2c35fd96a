//! Error types for the client engine.

use thiserror::Error;
use weft_protocol::{ErrorCode, ServiceError, TransportError};

/// Result type for client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Domain reported for errors raised by the client itself.
pub const CLIENT_DOMAIN: &str = "weft.client";

/// Domain reported for errors returned by the service.
pub const SERVICE_DOMAIN: &str = "weft.service";

/// Errors that can occur during client operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Entity or item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique name already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Caller lacks access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A mutation kept losing to concurrent writers.
    #[error("mutation gave up after {attempts} conflicting attempts")]
    ConflictRetryExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// The service is throttling requests.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The client was shut down.
    #[error("client is shutting down")]
    ShuttingDown,

    /// Network-level failure; the connection state reflects the outage.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rejected before any request was made.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unclassified failure.
    #[error("{0}")]
    Generic(String),
}

/// Structured description of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Where the error originated.
    pub domain: &'static str,
    /// Numeric error code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
}

impl SyncError {
    /// Creates an invalid-argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::RateLimited(_))
    }

    /// Returns the structured form of this error.
    pub fn info(&self) -> ErrorInfo {
        let (domain, code) = match self {
            SyncError::NotFound(_) => (SERVICE_DOMAIN, ErrorCode::NotFound.code()),
            SyncError::AlreadyExists(_) => (SERVICE_DOMAIN, ErrorCode::AlreadyExists.code()),
            SyncError::PermissionDenied(_) => (SERVICE_DOMAIN, ErrorCode::PermissionDenied.code()),
            SyncError::RateLimited(_) => (SERVICE_DOMAIN, ErrorCode::RateLimited.code()),
            SyncError::ConflictRetryExhausted { .. } => (CLIENT_DOMAIN, 1001),
            SyncError::ShuttingDown => (CLIENT_DOMAIN, 1002),
            SyncError::Transient(_) => (CLIENT_DOMAIN, 1003),
            SyncError::InvalidArgument(_) => (CLIENT_DOMAIN, 1004),
            SyncError::Generic(_) => (CLIENT_DOMAIN, 1000),
        };
        ErrorInfo {
            domain,
            code,
            message: self.to_string(),
        }
    }
}

impl From<ServiceError> for SyncError {
    fn from(err: ServiceError) -> Self {
        let message = err.message;
        match err.code {
            ErrorCode::NotFound => SyncError::NotFound(message),
            ErrorCode::AlreadyExists => SyncError::AlreadyExists(message),
            ErrorCode::PermissionDenied | ErrorCode::Unauthorized => {
                SyncError::PermissionDenied(message)
            }
            ErrorCode::RateLimited => SyncError::RateLimited(message),
            ErrorCode::InvalidRequest => SyncError::InvalidArgument(message),
            // Cleared by renewing the token
            ErrorCode::TokenExpired => SyncError::Transient(message),
            ErrorCode::RevisionConflict | ErrorCode::UnsupportedVersion | ErrorCode::Internal => {
                SyncError::Generic(message)
            }
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(reason) => SyncError::Transient(reason),
            TransportError::Closed => SyncError::ShuttingDown,
            TransportError::Service(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Transient("connection lost".into()).is_retryable());
        assert!(SyncError::RateLimited("slow down".into()).is_retryable());
        assert!(!SyncError::NotFound("gone".into()).is_retryable());
        assert!(!SyncError::ShuttingDown.is_retryable());
    }

    #[test]
    fn service_codes_map_onto_taxonomy() {
        let err: SyncError = ServiceError::new(ErrorCode::AlreadyExists, "prefs").into();
        assert_eq!(err, SyncError::AlreadyExists("prefs".into()));

        let err: SyncError = TransportError::Unavailable("offline".into()).into();
        assert!(matches!(err, SyncError::Transient(_)));

        let err: SyncError = TransportError::Closed.into();
        assert_eq!(err, SyncError::ShuttingDown);
    }

    #[test]
    fn error_info() {
        let info = SyncError::NotFound("map".into()).info();
        assert_eq!(info.domain, SERVICE_DOMAIN);
        assert_eq!(info.code, 54_100);
        assert!(info.message.contains("map"));

        let info = SyncError::ConflictRetryExhausted { attempts: 10 }.info();
        assert_eq!(info.domain, CLIENT_DOMAIN);
        assert!(info.message.contains("10"));
    }
}
