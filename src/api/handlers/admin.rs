//! Operator tooling: manual balance adjustment and reconciliation.
//!
//! Mounted only when `ADMIN_TOKEN` is configured.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::auth::AdminAccess;
use crate::api::dto::{AdjustBalanceRequest, AdjustBalanceResponse};
use crate::app_state::AppState;
use crate::domain::AccountId;
use crate::error::{ErrorResponse, GatewayError};
use crate::service::ReconcileReport;

/// `POST /admin/accounts/{id}/adjust` — Add or remove credits.
///
/// # Errors
///
/// Returns [`GatewayError::AccountNotFound`], [`GatewayError::ConcurrentModification`]
/// for a stale `expectedBalance`, or [`GatewayError::InsufficientCredits`]
/// if the balance would go negative.
#[utoipa::path(
    post,
    path = "/api/v1/admin/accounts/{id}/adjust",
    tag = "Admin",
    summary = "Adjust an account balance",
    params(
        ("id" = String, Path, description = "Account id"),
    ),
    request_body = AdjustBalanceRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Balance adjusted", body = AdjustBalanceResponse),
        (status = 401, description = "Invalid admin token", body = ErrorResponse),
        (status = 402, description = "Balance would go negative", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse),
        (status = 409, description = "Expected balance is stale", body = ErrorResponse),
    )
)]
pub async fn adjust_balance(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(id): Path<String>,
    body: Result<Json<AdjustBalanceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(req) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let account_id = AccountId::new(id);
    let credits = state
        .ledger
        .adjust(&account_id, req.delta, req.expected_balance)
        .await?;
    Ok(Json(AdjustBalanceResponse {
        account_id: account_id.into(),
        credits,
    }))
}

/// `POST /admin/reconcile` — Apply parked purchases, list discrepancies.
///
/// # Errors
///
/// Returns a persistence error on storage failure.
#[utoipa::path(
    post,
    path = "/api/v1/admin/reconcile",
    tag = "Admin",
    summary = "Run a reconciliation pass",
    description = "Applies claimed-but-unapplied purchase events whose account now exists and returns outstanding events and recorded billing discrepancies.",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Reconciliation report", body = ReconcileReport),
        (status = 401, description = "Invalid admin token", body = ErrorResponse),
    )
)]
pub async fn reconcile(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> Result<impl IntoResponse, GatewayError> {
    let report = state.ledger.reconcile().await?;
    Ok(Json(report))
}

/// Admin routes (mounted under `/api/v1`).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/accounts/{id}/adjust", post(adjust_balance))
        .route("/admin/reconcile", post(reconcile))
}
