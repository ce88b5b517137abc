//! Error types for Stratus services

use tonic::Status;

/// Result type alias using ControlError
pub type Result<T> = std::result::Result<T, ControlError>;

/// SQLSTATE surfaced for syntax errors and access violations.
pub const SQLSTATE_SYNTAX_ERROR_OR_ACCESS_VIOLATION: &str = "42000";
/// SQLSTATE surfaced for general runtime errors.
pub const SQLSTATE_GENERAL_ERROR: &str = "HY000";
/// SQLSTATE surfaced for unimplemented optional features.
pub const SQLSTATE_OPTIONAL_FEATURE_NOT_IMPLEMENTED: &str = "HYC00";

/// Main error type for the Stratus control plane
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    /// Session or query handle does not resolve
    #[error("{0}")]
    InvalidHandle(String),

    /// Session has been closed
    #[error("Session is closed")]
    SessionClosed,

    /// Session was expired by the idle-session timer
    #[error("{0}")]
    SessionExpired(String),

    /// Delegation (proxy) request denied
    #[error("{0}")]
    NotAuthorized(String),

    /// Bad flag values or unparseable defaults; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything the caller cannot act on beyond reporting
    #[error("{0}")]
    Internal(String),
}

impl ControlError {
    /// Create an internal error from any displayable value
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ControlError::Internal(err.to_string())
    }

    /// Stable error code, independent of the message text
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::InvalidHandle(_) => "INVALID_HANDLE",
            ControlError::SessionClosed => "SESSION_CLOSED",
            ControlError::SessionExpired(_) => "SESSION_EXPIRED",
            ControlError::NotAuthorized(_) => "NOT_AUTHORIZED",
            ControlError::Config(_) => "CONFIG_ERROR",
            ControlError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// SQLSTATE string reported to SQL clients
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ControlError::NotAuthorized(_) => SQLSTATE_SYNTAX_ERROR_OR_ACCESS_VIOLATION,
            _ => SQLSTATE_GENERAL_ERROR,
        }
    }
}

/// Convert ControlError to gRPC Status for RPC error responses
impl From<ControlError> for Status {
    fn from(err: ControlError) -> Self {
        let code = match &err {
            ControlError::InvalidHandle(_) => tonic::Code::NotFound,
            ControlError::SessionClosed => tonic::Code::FailedPrecondition,
            ControlError::SessionExpired(_) => tonic::Code::FailedPrecondition,
            ControlError::NotAuthorized(_) => tonic::Code::PermissionDenied,
            ControlError::Config(_) => tonic::Code::InvalidArgument,
            ControlError::Internal(_) => tonic::Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Internal(format!("IO error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ControlError::SessionClosed.code(), "SESSION_CLOSED");
        assert_eq!(
            ControlError::InvalidHandle("Invalid session id".into()).code(),
            "INVALID_HANDLE"
        );
    }

    #[test]
    fn test_sqlstate() {
        assert_eq!(
            ControlError::NotAuthorized("denied".into()).sqlstate(),
            SQLSTATE_SYNTAX_ERROR_OR_ACCESS_VIOLATION
        );
        assert_eq!(ControlError::SessionClosed.sqlstate(), SQLSTATE_GENERAL_ERROR);
    }

    #[test]
    fn test_error_to_status() {
        let err = ControlError::NotAuthorized("User 'bob' is not authorized".into());
        let status: Status = err.into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }
}
