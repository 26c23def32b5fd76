//! Caller account endpoint.

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::auth::AuthenticatedUser;
use crate::api::dto::AccountResponse;
use crate::app_state::AppState;
use crate::error::{ErrorResponse, GatewayError};

/// `GET /account` — The caller's balance and tier.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthenticated`] for a missing or invalid
/// session.
#[utoipa::path(
    get,
    path = "/api/v1/account",
    tag = "Account",
    summary = "Get the caller's account",
    description = "Returns the caller's credit balance and tier, provisioning the account on first call.",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Account record", body = AccountResponse),
        (status = 401, description = "Missing or invalid session", body = ErrorResponse),
    )
)]
pub async fn get_account(user: AuthenticatedUser) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(AccountResponse::from(user.account)))
}

/// Account routes (mounted under `/api/v1`).
pub fn routes() -> Router<AppState> {
    Router::new().route("/account", get(get_account))
}
