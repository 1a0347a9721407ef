use nudge_protocol::ErrorCode;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum NudgeError {
    #[error("not authenticated")]
    Unauthenticated,

    /// Unknown or expired session; the two are reported identically.
    #[error("invalid or expired session")]
    InvalidSession,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("user account is inactive")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NudgeError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            NudgeError::Unauthenticated => (ErrorCode::AuthRequired, self.to_string()),
            NudgeError::InvalidSession => (ErrorCode::InvalidSession, self.to_string()),
            NudgeError::InvalidCredentials => (ErrorCode::InvalidCredentials, self.to_string()),
            NudgeError::Forbidden => (ErrorCode::UserInactive, self.to_string()),
            NudgeError::NotFound(_) => (ErrorCode::ResourceNotFound, self.to_string()),
            NudgeError::Conflict(_) => (ErrorCode::ResourceExists, self.to_string()),
            NudgeError::Validation(_) => (ErrorCode::ValidationError, self.to_string()),
            NudgeError::StoreUnavailable(_) => (
                ErrorCode::DatabaseError,
                "database operation failed".to_string(),
            ),
            NudgeError::Internal(_) => (
                ErrorCode::InternalError,
                "an unexpected error occurred".to_string(),
            ),
        }
    }

    /// True for every rejection that means "who are you?" rather than "not allowed".
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            NudgeError::Unauthenticated | NudgeError::InvalidSession | NudgeError::InvalidCredentials
        )
    }
}

impl From<StoreError> for NudgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => NudgeError::Conflict(msg),
            other => NudgeError::StoreUnavailable(other),
        }
    }
}

pub type Result<T, E = NudgeError> = std::result::Result<T, E>;
