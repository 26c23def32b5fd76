//! System endpoints: health check and pricing catalog.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::domain::PricingTable;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
}

/// `GET /health` — Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health status, version, and current timestamp.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// `GET /config/pricing` — Generation cost and plan offers.
#[utoipa::path(
    get,
    path = "/config/pricing",
    tag = "System",
    summary = "Pricing catalog",
    description = "Returns the credits charged per generation and the credits granted by every plan offer.",
    responses(
        (status = 200, description = "Pricing table", body = PricingTable),
    )
)]
pub async fn pricing_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(PricingTable::clone(&state.pricing)))
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/config/pricing", get(pricing_handler))
}
