//! API error handling.
//!
//! Structured error responses with proper HTTP status codes and request
//! tracking.

use crate::errors::CasinoError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code (NOT_FOUND, BAD_REQUEST, CONFLICT, ...)
    pub code: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound(String),
    BadRequest(String),
    /// Valid request against the wrong state (terminal game, non-pending
    /// period).
    Conflict(String),
    /// Payment-level rejection, surfaced with its own code so clients can
    /// show the exact shortfall.
    InsufficientBalance { needed: u64, available: u64 },
    InternalError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn internal_error(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message),
            request_id,
        }
    }

    /// Map a domain error onto the API taxonomy. `DuplicateEvent` is not
    /// mapped here; idempotent handlers turn it into a success before this
    /// point.
    pub fn from_domain(request_id: String, err: CasinoError) -> Self {
        let kind = match err {
            CasinoError::InvalidInput(msg) => ApiErrorKind::BadRequest(msg),
            CasinoError::InsufficientBalance { needed, available } => {
                ApiErrorKind::InsufficientBalance { needed, available }
            }
            CasinoError::InvalidGameState(msg) => ApiErrorKind::Conflict(msg),
            CasinoError::ExternalSendFailure(msg) => ApiErrorKind::ServiceUnavailable(msg),
            CasinoError::DuplicateEvent { reference } => {
                ApiErrorKind::Conflict(format!("duplicate event {}", reference))
            }
            CasinoError::Storage(msg) | CasinoError::Configuration(msg) => {
                ApiErrorKind::InternalError(msg)
            }
        };
        Self { kind, request_id }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => write!(f, "[{}] Not Found: {}", self.request_id, msg),
            ApiErrorKind::BadRequest(msg) => {
                write!(f, "[{}] Bad Request: {}", self.request_id, msg)
            }
            ApiErrorKind::Conflict(msg) => write!(f, "[{}] Conflict: {}", self.request_id, msg),
            ApiErrorKind::InsufficientBalance { needed, available } => write!(
                f,
                "[{}] Insufficient Balance: need {}, have {}",
                self.request_id, needed, available
            ),
            ApiErrorKind::InternalError(msg) => {
                write!(f, "[{}] Internal Error: {}", self.request_id, msg)
            }
            ApiErrorKind::ServiceUnavailable(msg) => {
                write!(f, "[{}] Service Unavailable: {}", self.request_id, msg)
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self.kind {
            ApiErrorKind::NotFound(msg) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None)
            }
            ApiErrorKind::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None)
            }
            ApiErrorKind::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None),
            ApiErrorKind::InsufficientBalance { needed, available } => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_BALANCE",
                format!("need {}, have {}", needed, available),
                Some(serde_json::json!({ "needed": needed, "available": available })),
            ),
            ApiErrorKind::InternalError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
                None,
            ),
            ApiErrorKind::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_mapping() {
        let err = ApiError::from_domain(
            "req-1".to_string(),
            CasinoError::InsufficientBalance {
                needed: 100,
                available: 40,
            },
        );
        assert!(matches!(
            err.kind,
            ApiErrorKind::InsufficientBalance {
                needed: 100,
                available: 40
            }
        ));

        let err = ApiError::from_domain(
            "req-2".to_string(),
            CasinoError::invalid_game_state("terminal"),
        );
        assert!(matches!(err.kind, ApiErrorKind::Conflict(_)));
    }
}
