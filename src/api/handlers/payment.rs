//! Checkout and purchase-webhook handlers.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::auth::AuthenticatedUser;
use crate::api::dto::{
    CheckoutRequest, CheckoutResponse, VerifyCheckoutQuery, VerifyCheckoutResponse, WebhookAck,
};
use crate::app_state::AppState;
use crate::error::{ErrorResponse, GatewayError};
use crate::service::{WebhookOutcome, WebhookPayload};

/// Header carrying the hex HMAC-SHA256 of the raw webhook body.
pub const SIGNATURE_HEADER: &str = "x-creem-signature";

/// `POST /payments/webhook` — Purchase notification from the processor.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthenticated`] on a bad signature and a 500
/// only if the claim could not be persisted. Unparseable or unpriceable
/// payloads are acknowledged with status `rejected`.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    tag = "Payments",
    summary = "Purchase webhook",
    description = "Credits the buyer's account exactly once per processor event id. Re-deliveries are acknowledged without crediting again. `subscription.canceled` resets the buyer's plan tier. Other event types are acknowledged and ignored. A payload that cannot be parsed, priced, or attributed is acknowledged with status `rejected` and logged, so the processor does not retry it.",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Notification acknowledged", body = WebhookAck),
        (status = 401, description = "Bad signature", body = ErrorResponse),
        (status = 500, description = "Claim not persisted; re-deliver", body = ErrorResponse),
    )
)]
pub async fn purchase_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, GatewayError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    state.payments.verify_signature(&body, signature)?;

    let outcome = match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => state.payments.handle_webhook(&payload).await?,
        Err(e) => {
            tracing::error!(error = %e, bytes = body.len(), "malformed webhook body rejected");
            WebhookOutcome::Rejected {
                reason: format!("malformed notification: {e}"),
            }
        }
    };

    Ok(Json(WebhookAck {
        received: true,
        status: outcome.as_str().to_string(),
    }))
}

/// `POST /checkout` — Start a hosted checkout for a plan.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for unknown plans or
/// [`GatewayError::PaymentProvider`] if the processor fails.
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    tag = "Payments",
    summary = "Create a checkout session",
    description = "Creates a processor checkout session carrying the caller's account id, email, plan, and billing period, and returns the processor's redirect URL unchanged.",
    request_body = CheckoutRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session created", body = CheckoutResponse),
        (status = 400, description = "Unknown plan", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session", body = ErrorResponse),
        (status = 502, description = "Processor failed", body = ErrorResponse),
    )
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    body: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(req) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let session = state
        .payments
        .start_checkout(&user.identity, &req.plan_id, req.billing_period)
        .await?;
    Ok(Json(CheckoutResponse {
        checkout_url: session.checkout_url,
        session_id: session.session_id,
    }))
}

/// `GET /checkout/verify` — Ask the processor whether a session was paid.
///
/// Never grants credits; the webhook does.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for a malformed session id or
/// [`GatewayError::PaymentProvider`] if the lookup fails.
#[utoipa::path(
    get,
    path = "/api/v1/checkout/verify",
    tag = "Payments",
    summary = "Verify a checkout session",
    params(VerifyCheckoutQuery),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session status", body = VerifyCheckoutResponse),
        (status = 400, description = "Malformed session id", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session", body = ErrorResponse),
        (status = 502, description = "Processor failed", body = ErrorResponse),
    )
)]
pub async fn verify_checkout(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(query): Query<VerifyCheckoutQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let status = state.payments.verify_checkout(&query.session_id).await?;
    Ok(Json(VerifyCheckoutResponse {
        verified: status.paid,
        status: status.status,
        session_id: status.session_id,
    }))
}

/// Payment routes (mounted under `/api/v1`).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/payments/webhook", post(purchase_webhook))
        .route("/checkout", post(create_checkout))
        .route("/checkout/verify", get(verify_checkout))
}
