//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Each variant
//! maps to a specific HTTP status code and a structured JSON error body. The
//! three failures a user can act on (sign in again, buy credits, retry the
//! generation) always carry distinct messages and codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::persistence::LedgerError;
use crate::upstream::UpstreamFailure;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": "Not enough credits. Please purchase more credits to continue.",
///   "code": "insufficient_credits",
///   "details": "requires 2 credits, balance is 1"
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable message suitable for display.
    pub error: String,
    /// Stable machine-readable error kind.
    pub code: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Whether retrying the same request may succeed. Only set for
    /// upstream failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// | Variant                  | HTTP Status               |
/// |--------------------------|---------------------------|
/// | `InvalidRequest`         | 400 Bad Request           |
/// | `Unauthenticated`        | 401 Unauthorized          |
/// | `InsufficientCredits`    | 402 Payment Required      |
/// | `AccountNotFound`        | 404 Not Found             |
/// | `ConcurrentModification` | 409 Conflict              |
/// | `Upstream`               | 429 / 502 / 504           |
/// | `PaymentProvider`        | 502 Bad Gateway           |
/// | `AuthUnavailable`        | 503 Service Unavailable   |
/// | `PersistenceError`       | 500 Internal Server Error |
/// | `Internal`               | 500 Internal Server Error |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or invalid bearer credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The account cannot afford the requested operation.
    #[error("insufficient credits: requires {required}, balance is {available}")]
    InsufficientCredits {
        /// Credits the operation costs.
        required: i64,
        /// Credits the account held when the check failed.
        available: i64,
    },

    /// The image-generation API failed.
    #[error("upstream error: {0}")]
    Upstream(UpstreamFailure),

    /// A ledger race survived the internal retry.
    #[error("concurrent modification of account balance")]
    ConcurrentModification,

    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No account with the given identifier.
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// The hosted auth provider could not be reached.
    #[error("auth provider unavailable: {0}")]
    AuthUnavailable(String),

    /// The payment processor rejected or failed a request.
    #[error("payment provider error: {0}")]
    PaymentProvider(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the stable machine-readable code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::Upstream(_) => "upstream_error",
            Self::ConcurrentModification => "concurrent_modification",
            Self::InvalidRequest(_) => "invalid_request",
            Self::AccountNotFound(_) => "account_not_found",
            Self::AuthUnavailable(_) => "auth_unavailable",
            Self::PaymentProvider(_) => "payment_provider_error",
            Self::PersistenceError(_) => "persistence_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::AccountNotFound(_) => StatusCode::NOT_FOUND,
            Self::ConcurrentModification => StatusCode::CONFLICT,
            Self::Upstream(failure) => failure.status_code(),
            Self::PaymentProvider(_) => StatusCode::BAD_GATEWAY,
            Self::AuthUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PersistenceError(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds the JSON body returned to the client.
    #[must_use]
    pub fn to_response_body(&self) -> ErrorResponse {
        let (error, details, retryable) = match self {
            Self::Unauthenticated(reason) => (
                "Authentication required. Please sign in again.".to_string(),
                Some(reason.clone()),
                None,
            ),
            Self::InsufficientCredits {
                required,
                available,
            } => (
                "Not enough credits. Please purchase more credits to continue.".to_string(),
                Some(format!("requires {required} credits, balance is {available}")),
                None,
            ),
            Self::Upstream(failure) => (
                "The image generation service failed. Please try again.".to_string(),
                Some(failure.to_string()),
                Some(failure.is_retryable()),
            ),
            // Internal details stay in the logs.
            Self::PersistenceError(_) | Self::Internal(_) => {
                ("Internal server error".to_string(), None, None)
            }
            other => (other.to_string(), None, None),
        };
        ErrorResponse {
            error,
            code: self.error_code().to_string(),
            details,
            retryable,
        }
    }
}

impl From<LedgerError> for GatewayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AccountNotFound(id) => Self::AccountNotFound(id),
            LedgerError::InsufficientCredits {
                required,
                available,
            } => Self::InsufficientCredits {
                required,
                available,
            },
            LedgerError::ConcurrentModification => Self::ConcurrentModification,
            LedgerError::InvalidAmount(amount) => {
                Self::InvalidRequest(format!("amount must be positive, got {amount}"))
            }
            LedgerError::Database(msg) => Self::PersistenceError(msg),
        }
    }
}

impl From<UpstreamFailure> for GatewayError {
    fn from(failure: UpstreamFailure) -> Self {
        Self::Upstream(failure)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), error = %self, "request failed");
        }
        let mut response = axum::Json(self.to_response_body()).into_response();
        *response.status_mut() = status;
        response
    }
}
