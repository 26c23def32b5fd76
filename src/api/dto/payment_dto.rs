//! DTOs for checkout and webhook endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::BillingPeriod;

/// Request body for `POST /api/v1/checkout`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    /// Plan id (`basic`, `pro`, `max`).
    pub plan_id: String,
    /// Billing period; defaults to the plan's purchasable offer.
    #[serde(default)]
    pub billing_period: Option<BillingPeriod>,
}

/// A created checkout session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    /// Hosted checkout page to redirect the buyer to.
    pub checkout_url: String,
    /// Processor session id.
    pub session_id: String,
}

/// Query for `GET /api/v1/checkout/verify`.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct VerifyCheckoutQuery {
    /// Processor session id.
    pub session_id: String,
}

/// Checkout verification result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCheckoutResponse {
    /// Whether the processor reports the session as paid.
    pub verified: bool,
    /// Raw processor status.
    pub status: String,
    /// Processor session id.
    pub session_id: String,
}

/// Webhook acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    /// Always `true`.
    pub received: bool,
    /// One of `credited`, `pending`, `duplicate`, `canceled`, `rejected`, `ignored`.
    pub status: String,
}
