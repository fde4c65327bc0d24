//! HTTP rendering of engine errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::{EngineError, ErrorCode};

/// Error body: `{ "code", "message", "retryable" }`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
            retryable: false,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthenticated",
            message: "missing x-participant-id header".to_string(),
            retryable: false,
        }
    }
}

const fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorCode::WalletNotFound | ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::NotParticipant => StatusCode::FORBIDDEN,
        ErrorCode::InvalidAmount => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::ReservationExpired => StatusCode::GONE,
        ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::OverCapture
        | ErrorCode::OverRelease
        | ErrorCode::OverRefund
        | ErrorCode::StaleTransition
        | ErrorCode::SessionNotActive
        | ErrorCode::ReservationExists
        | ErrorCode::IdempotencyConflict
        | ErrorCode::OperationInFlight => StatusCode::CONFLICT,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let code = err.code();
        Self {
            status: status_for(code),
            code: code.as_str(),
            message: err.to_string(),
            retryable: err.retryable(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}
