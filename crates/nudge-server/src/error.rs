use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use libnudge::{NudgeError, StoreError};
use nudge_protocol::{ErrorBody, ErrorCode};

/// A rejection rendered as `{"detail", "error_code"}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub NudgeError);

impl From<NudgeError> for ApiError {
    fn from(err: NudgeError) -> Self {
        Self(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self(NudgeError::Validation(msg.into()))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self(NudgeError::NotFound(what.into()))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self(NudgeError::Internal(msg.into()))
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AuthRequired | ErrorCode::InvalidSession | ErrorCode::InvalidCredentials => {
            StatusCode::UNAUTHORIZED
        }
        ErrorCode::UserInactive => StatusCode::FORBIDDEN,
        ErrorCode::ResourceNotFound => StatusCode::NOT_FOUND,
        ErrorCode::ResourceExists => StatusCode::CONFLICT,
        ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::DatabaseError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self.0, NudgeError::StoreUnavailable(_) | NudgeError::Internal(_)) {
            error!(error = %self.0, "request failed");
        }
        let challenge = self.0.is_unauthenticated();
        let (error_code, detail) = self.0.to_error_code();
        let mut response =
            (status_for(error_code), Json(ErrorBody { detail, error_code })).into_response();
        if challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_codes() {
        let cases = [
            (NudgeError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (NudgeError::InvalidSession, StatusCode::UNAUTHORIZED),
            (NudgeError::Forbidden, StatusCode::FORBIDDEN),
            (NudgeError::NotFound("todo".into()), StatusCode::NOT_FOUND),
            (NudgeError::Conflict("dup".into()), StatusCode::CONFLICT),
            (NudgeError::Validation("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                NudgeError::StoreUnavailable(StoreError::Backend("x".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (NudgeError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }

    #[test]
    fn only_unauthenticated_rejections_carry_a_challenge() {
        for err in [
            NudgeError::Unauthenticated,
            NudgeError::InvalidSession,
            NudgeError::InvalidCredentials,
        ] {
            let response = ApiError(err).into_response();
            assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        }
        for err in [NudgeError::Forbidden, NudgeError::NotFound("todo".into())] {
            let response = ApiError(err).into_response();
            assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
        }
    }
}
