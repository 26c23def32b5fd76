//! Metered image generation and unmetered image analysis.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::auth::AuthenticatedUser;
use crate::api::dto::{
    AnalyzeImageRequest, AnalyzeImageResponse, GenerateImageRequest, GenerateImageResponse,
};
use crate::app_state::AppState;
use crate::error::{ErrorResponse, GatewayError};

/// `POST /generate-image` — Generate an image and debit its cost.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthenticated`], [`GatewayError::InvalidRequest`],
/// [`GatewayError::InsufficientCredits`] (the upstream is not called), or
/// [`GatewayError::Upstream`] (nothing is debited).
#[utoipa::path(
    post,
    path = "/api/v1/generate-image",
    tag = "Generation",
    summary = "Generate an image",
    description = "Checks the caller's balance against the fixed generation cost, calls the upstream model, and debits the cost only after an image was produced. If the debit loses a race the image is still returned with `billingDiscrepancy: true`.",
    request_body = GenerateImageRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Image generated", body = GenerateImageResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session", body = ErrorResponse),
        (status = 402, description = "Not enough credits", body = ErrorResponse),
        (status = 429, description = "Upstream rate limited", body = ErrorResponse),
        (status = 502, description = "Upstream failed", body = ErrorResponse),
        (status = 504, description = "Upstream timed out", body = ErrorResponse),
    )
)]
pub async fn generate_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    body: Result<Json<GenerateImageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(req) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let outcome = state
        .generation
        .generate(&user.identity, req.into())
        .await?;
    Ok(Json(GenerateImageResponse::from(outcome)))
}

/// `POST /analyze-image` — Describe an image in text.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthenticated`], [`GatewayError::InvalidRequest`]
/// for a missing or malformed `imageUrl`, or [`GatewayError::Upstream`].
#[utoipa::path(
    post,
    path = "/api/v1/analyze-image",
    tag = "Generation",
    summary = "Analyze an image",
    description = "Asks the default model a question about one image and returns its text answer. Costs no credits.",
    request_body = AnalyzeImageRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Image analyzed", body = AnalyzeImageResponse),
        (status = 400, description = "Missing or malformed imageUrl", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session", body = ErrorResponse),
        (status = 429, description = "Upstream rate limited", body = ErrorResponse),
        (status = 502, description = "Upstream failed", body = ErrorResponse),
        (status = 504, description = "Upstream timed out", body = ErrorResponse),
    )
)]
pub async fn analyze_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    body: Result<Json<AnalyzeImageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(req) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let answer = state
        .analysis
        .analyze(&user.identity, req.image_url, req.prompt)
        .await?;
    Ok(Json(AnalyzeImageResponse::from(answer)))
}

/// Generation routes (mounted under `/api/v1`).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/generate-image", post(generate_image))
        .route("/analyze-image", post(analyze_image))
}
