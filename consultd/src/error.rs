//! Error taxonomy for the session and ledger engine.

use serde::Serialize;
use thiserror::Error;

use crate::models::{SessionId, SessionState, WalletId};
use crate::store::StoreError;

/// Result type alias using the engine's error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable, client-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InsufficientFunds,
    OverCapture,
    OverRelease,
    OverRefund,
    StaleTransition,
    SessionNotActive,
    ReservationExpired,
    ReservationExists,
    IdempotencyConflict,
    OperationInFlight,
    WalletNotFound,
    SessionNotFound,
    NotParticipant,
    InvalidAmount,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Convert code to its wire string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientFunds => "insufficient_funds",
            Self::OverCapture => "over_capture",
            Self::OverRelease => "over_release",
            Self::OverRefund => "over_refund",
            Self::StaleTransition => "stale_transition",
            Self::SessionNotActive => "session_not_active",
            Self::ReservationExpired => "reservation_expired",
            Self::ReservationExists => "reservation_exists",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::OperationInFlight => "operation_in_flight",
            Self::WalletNotFound => "wallet_not_found",
            Self::SessionNotFound => "session_not_found",
            Self::NotParticipant => "not_participant",
            Self::InvalidAmount => "invalid_amount",
            Self::ServiceUnavailable => "service_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised by ledger, session and relay operations.
///
/// Every variant is local to the failed operation: no wallet or session
/// invariant is disturbed and the caller may retry after inspecting state.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("insufficient funds in wallet {wallet_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        wallet_id: WalletId,
        available: i64,
        requested: i64,
    },

    #[error("capture of {requested} exceeds {held} held for session {session_id}")]
    OverCapture {
        session_id: SessionId,
        held: i64,
        requested: i64,
    },

    #[error("release of {requested} exceeds {held} held for session {session_id}")]
    OverRelease {
        session_id: SessionId,
        held: i64,
        requested: i64,
    },

    #[error("refund of {requested} exceeds {refundable} refundable for session {session_id}")]
    OverRefund {
        session_id: SessionId,
        refundable: i64,
        requested: i64,
    },

    #[error("session {session_id} is {actual}, expected {expected}")]
    StaleTransition {
        session_id: SessionId,
        expected: SessionState,
        actual: SessionState,
    },

    #[error("session {0} is not active")]
    SessionNotActive(SessionId),

    #[error("reservation for session {0} expired before acceptance")]
    ReservationExpired(SessionId),

    #[error("session {0} already holds an open reservation")]
    ReservationExists(SessionId),

    #[error("idempotency key {key} was already used with different parameters")]
    IdempotencyConflict { key: String },

    #[error("operation with idempotency key {key} is still in flight")]
    OperationInFlight { key: String },

    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("{participant} is not a participant of session {session_id}")]
    NotParticipant {
        session_id: SessionId,
        participant: String,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
}

impl EngineError {
    /// Client-facing code for this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            Self::OverCapture { .. } => ErrorCode::OverCapture,
            Self::OverRelease { .. } => ErrorCode::OverRelease,
            Self::OverRefund { .. } => ErrorCode::OverRefund,
            Self::StaleTransition { .. } => ErrorCode::StaleTransition,
            Self::SessionNotActive(_) => ErrorCode::SessionNotActive,
            Self::ReservationExpired(_) => ErrorCode::ReservationExpired,
            Self::ReservationExists(_) => ErrorCode::ReservationExists,
            Self::IdempotencyConflict { .. } => ErrorCode::IdempotencyConflict,
            Self::OperationInFlight { .. } => ErrorCode::OperationInFlight,
            Self::WalletNotFound(_) => ErrorCode::WalletNotFound,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::NotParticipant { .. } => ErrorCode::NotParticipant,
            Self::InvalidAmount(_) => ErrorCode::InvalidAmount,
            Self::Storage(_) => ErrorCode::ServiceUnavailable,
        }
    }

    /// Whether retrying the identical request may succeed without any
    /// other change in state.
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::OperationInFlight { .. })
    }

    /// Whether the error means the wallet could not fund the request.
    pub const fn is_funding_shortfall(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. } | Self::OverCapture { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_retryable() {
        let err = EngineError::from(StoreError::Unavailable("disk full".into()));
        assert!(err.retryable());
        assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    }

    #[test]
    fn business_errors_are_not_retryable() {
        let err = EngineError::InsufficientFunds {
            wallet_id: "alice".into(),
            available: 10,
            requested: 100,
        };
        assert!(!err.retryable());
        assert!(err.is_funding_shortfall());
        assert_eq!(err.code().as_str(), "insufficient_funds");
    }

    #[test]
    fn codes_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCode::StaleTransition).unwrap();
        assert_eq!(json, "\"stale_transition\"");
    }
}
