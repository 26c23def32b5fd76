//! DTOs for the generation and analysis endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::{GenerationMode, GenerationParams};
use crate::service::GenerationOutcome;
use crate::upstream::ImageAnalysis;

/// Request body for `POST /api/v1/generate-image`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImageRequest {
    /// Prompt text.
    pub prompt: String,
    /// `text-to-image` (default) or `image-to-image`.
    #[serde(default = "default_mode")]
    pub mode: GenerationMode,
    /// Reference image for image-to-image (`http(s)` or `data:` URL).
    #[serde(default)]
    pub image_url: Option<String>,
    /// `1:1`, `4:3`, `3:4`, `16:9`, `9:16`; anything else means `1:1`.
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    /// Upstream model; must be on the allowlist.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_mode() -> GenerationMode {
    GenerationMode::TextToImage
}

impl From<GenerateImageRequest> for GenerationParams {
    fn from(req: GenerateImageRequest) -> Self {
        Self {
            prompt: req.prompt,
            mode: req.mode,
            image_url: req.image_url,
            aspect_ratio: req.aspect_ratio,
            model: req.model,
        }
    }
}

/// Successful generation response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImageResponse {
    /// Always `true`.
    pub success: bool,
    /// Generated image URL.
    pub image_url: String,
    /// Balance after this request.
    pub remaining_credits: i64,
    /// Credits this request cost.
    pub credits_charged: i64,
    /// Model that produced the image.
    pub model: String,
    /// Aspect ratio used.
    pub aspect_ratio: String,
    /// Generation mode.
    pub mode: GenerationMode,
    /// Correlation id.
    pub request_id: Uuid,
    /// Present and `true` when the image was delivered but could not be
    /// billed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub billing_discrepancy: bool,
}

impl From<GenerationOutcome> for GenerateImageResponse {
    fn from(outcome: GenerationOutcome) -> Self {
        Self {
            success: true,
            image_url: outcome.image_url,
            remaining_credits: outcome.remaining_credits,
            credits_charged: outcome.credits_charged,
            model: outcome.model,
            aspect_ratio: outcome.aspect_ratio,
            mode: outcome.mode,
            request_id: outcome.request_id,
            billing_discrepancy: outcome.billing_discrepancy,
        }
    }
}

/// Request body for `POST /api/v1/analyze-image`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeImageRequest {
    /// Image to describe (`http(s)` or `data:` URL). Required.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Question about the image. Defaults to "What is in this image?".
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Successful analysis response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeImageResponse {
    /// Always `true`.
    pub success: bool,
    /// The model's answer.
    pub analysis: String,
    /// Model that answered.
    pub model: String,
}

impl From<ImageAnalysis> for AnalyzeImageResponse {
    fn from(answer: ImageAnalysis) -> Self {
        Self {
            success: true,
            analysis: answer.analysis,
            model: answer.model,
        }
    }
}
