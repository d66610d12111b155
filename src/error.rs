//! Ledger error types with HTTP status code mapping.
//!
//! [`LedgerError`] is the central error type of the crate. Each variant
//! maps to a specific HTTP status code and structured JSON error response.
//! Business rejections of bonus claims are *not* errors; they travel as
//! typed outcomes (see [`crate::domain::ClaimRejection`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::persistence::StoreError;
use crate::resilience::Retryable;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 4001,
///     "message": "insufficient balance: have 5, need 10",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges below).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category        | HTTP Status                  |
/// |-----------|-----------------|------------------------------|
/// | 1000–1999 | Validation      | 400 Bad Request              |
/// | 3000–3999 | Server          | 500 / 503                    |
/// | 4000–4999 | Ledger          | 422 Unprocessable Entity     |
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A coin amount violates a ledger precondition.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A decrement would take the balance below zero.
    #[error("insufficient balance: have {balance}, need {requested}")]
    InsufficientBalance {
        /// Balance at the time of the check.
        balance: i64,
        /// Coins requested.
        requested: i64,
    },

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A circuit breaker refused the call.
    #[error("circuit breaker open for {service}")]
    BreakerOpen {
        /// Breaker name.
        service: String,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::InvalidAmount(_) => 1002,
            Self::Internal(_) => 3000,
            Self::Store(_) => 3001,
            Self::BreakerOpen { .. } => 3002,
            Self::InsufficientBalance { .. } => 4001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Retryable for LedgerError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_maps_to_422() {
        let err = LedgerError::InsufficientBalance {
            balance: 5,
            requested: 10,
        };
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.error_code(), 4001);
        assert_eq!(err.to_string(), "insufficient balance: have 5, need 10");
    }

    #[test]
    fn only_store_conflicts_are_retryable() {
        assert!(LedgerError::Store(StoreError::Conflict("40001".to_string())).is_conflict());
        assert!(!LedgerError::Store(StoreError::Database("boom".to_string())).is_conflict());
        assert!(!LedgerError::InvalidAmount("x".to_string()).is_conflict());
    }
}
