//! Request-facing error taxonomy.
//!
//! Every rejection carries a stable `code` so clients can branch on
//! "try again later" / "log in again" / "not allowed" / "refetch and retry"
//! without parsing message text. Server-side detail is logged here and never
//! echoed to the caller.

use axum::{
    http::{header::WWW_AUTHENTICATE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::api::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("invalid authentication credentials")]
    MalformedCredential,
    #[error("invalid or malformed authentication token")]
    InvalidTokenFormat,
    #[error("invalid or expired authentication token")]
    UnknownOrExpiredToken,
    #[error("you must be authenticated to access this resource")]
    Unauthenticated,
    #[error("your user account must be activated to access this resource")]
    AccountNotActivated,
    #[error("your user account doesn't have the necessary permissions to access this resource")]
    PermissionDenied,
    #[error("unable to update the record due to an edit conflict, please try again")]
    EditConflict,
    #[error("the requested resource could not be found")]
    NotFound,
    #[error("a backend dependency timed out")]
    DependencyTimeout,
    #[error("the server encountered a problem and could not process your request")]
    Internal(anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable classification.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::MalformedCredential => "malformed_credential",
            Self::InvalidTokenFormat => "invalid_token_format",
            Self::UnknownOrExpiredToken => "unknown_or_expired_token",
            Self::Unauthenticated => "unauthenticated",
            Self::AccountNotActivated => "account_not_activated",
            Self::PermissionDenied => "permission_denied",
            Self::EditConflict => "edit_conflict",
            Self::NotFound => "not_found",
            Self::DependencyTimeout => "dependency_timeout",
            Self::Internal(_) => "internal",
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::MalformedCredential
            | Self::InvalidTokenFormat
            | Self::UnknownOrExpiredToken
            | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::AccountNotActivated | Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::EditConflict => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DependencyTimeout | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EditConflict => Self::EditConflict,
            StoreError::DependencyTimeout => Self::DependencyTimeout,
            StoreError::Database(err) => Self::Internal(err.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Full detail stays in the logs, the wire carries the envelope only
        if let Self::Internal(detail) = &self {
            error!("internal error: {detail:#}");
        } else if matches!(self, Self::DependencyTimeout) {
            error!("dependency deadline exceeded");
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        let mut response = (self.status(), body).into_response();

        // Token-shaped failures advertise the expected scheme
        if matches!(
            self,
            Self::InvalidTokenFormat | Self::UnknownOrExpiredToken
        ) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        response
    }
}
