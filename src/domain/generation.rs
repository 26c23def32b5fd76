//! Generation requests: validation and prompt shaping.
//!
//! A [`GenerationRequest`] is the ephemeral unit of work the proxy meters.
//! It is never persisted. Construction validates everything that can be
//! checked locally so that a malformed request never reaches the gate or
//! the upstream API.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::AccountId;
use crate::error::GatewayError;

/// Largest reference image accepted inline as a data URL (decoded bytes).
pub const MAX_INLINE_IMAGE_BYTES: usize = 7 * 1024 * 1024;

/// Aspect ratios forwarded to the upstream model as-is. Everything else,
/// including `auto`, becomes `1:1`.
const SUPPORTED_ASPECT_RATIOS: [&str; 5] = ["1:1", "4:3", "3:4", "16:9", "9:16"];

const DEFAULT_ASPECT_RATIO: &str = "1:1";

/// Question asked about an image when the client sends none.
pub const DEFAULT_ANALYSIS_PROMPT: &str = "What is in this image?";

#[allow(clippy::expect_used)]
static EXPLICIT_IMAGE_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(generate|create|draw|make|design)\s+(an\s+)?image")
        .expect("literal pattern compiles")
});

#[allow(clippy::expect_used)]
static DATA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^data:([^;,]+);base64,(.+)$").expect("literal pattern compiles")
});

/// How the image is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum GenerationMode {
    /// Prompt only.
    #[serde(rename = "text-to-image")]
    TextToImage,
    /// Prompt plus a reference image.
    #[serde(rename = "image-to-image")]
    ImageToImage,
}

impl GenerationMode {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "text-to-image",
            Self::ImageToImage => "image-to-image",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-supplied generation parameters before validation.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Prompt text.
    pub prompt: String,
    /// Generation mode.
    pub mode: GenerationMode,
    /// Reference image (`http(s)` or `data:` URL).
    pub image_url: Option<String>,
    /// Requested aspect ratio.
    pub aspect_ratio: Option<String>,
    /// Requested model.
    pub model: Option<String>,
}

/// Server-side generation policy: fixed cost and model allowlist.
#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    /// Credits charged per request.
    pub cost: i64,
    /// Model used when the client does not pick one.
    pub default_model: String,
    /// Models a client may pick.
    pub allowed_models: Vec<String>,
}

/// A validated, priced generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Requesting account.
    pub account_id: AccountId,
    /// Prompt as the client sent it (trimmed).
    pub prompt: String,
    /// Prompt forwarded upstream.
    pub upstream_prompt: String,
    /// Generation mode.
    pub mode: GenerationMode,
    /// Reference image, present iff `mode` is image-to-image.
    pub image_url: Option<String>,
    /// Normalized aspect ratio.
    pub aspect_ratio: String,
    /// Upstream model.
    pub model: String,
    /// Credits this request costs. Fixed before the upstream call.
    pub cost: i64,
}

impl GenerationRequest {
    /// Validates client parameters against the policy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a blank prompt, a
    /// missing or malformed reference image, or a model outside the
    /// allowlist.
    pub fn new(
        account_id: AccountId,
        params: GenerationParams,
        policy: &GenerationPolicy,
    ) -> Result<Self, GatewayError> {
        let prompt = params.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(GatewayError::InvalidRequest("prompt is required".to_string()));
        }

        let image_url = match params.mode {
            GenerationMode::ImageToImage => {
                let url = params
                    .image_url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| {
                        GatewayError::InvalidRequest(
                            "image-to-image mode requires a reference image".to_string(),
                        )
                    })?;
                validate_image_url(&url)?;
                Some(url)
            }
            GenerationMode::TextToImage => None,
        };

        let model = match params.model {
            Some(m) if policy.allowed_models.iter().any(|a| *a == m) => m,
            Some(m) => {
                return Err(GatewayError::InvalidRequest(format!(
                    "model {m} is not available"
                )));
            }
            None => policy.default_model.clone(),
        };

        Ok(Self {
            account_id,
            upstream_prompt: shape_prompt(&prompt, params.mode),
            prompt,
            mode: params.mode,
            image_url,
            aspect_ratio: normalize_aspect_ratio(params.aspect_ratio.as_deref()),
            model,
            cost: policy.cost,
        })
    }
}

/// A validated image-analysis request. Analysis answers in text and is not
/// metered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Requesting account.
    pub account_id: AccountId,
    /// Image to describe (`http(s)` or `data:` URL).
    pub image_url: String,
    /// Question about the image.
    pub prompt: String,
    /// Upstream model.
    pub model: String,
}

impl AnalysisRequest {
    /// Validates an analysis request. A blank prompt becomes
    /// [`DEFAULT_ANALYSIS_PROMPT`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a missing or malformed
    /// image URL.
    pub fn new(
        account_id: AccountId,
        image_url: Option<String>,
        prompt: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let image_url = image_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GatewayError::InvalidRequest("imageUrl is required".to_string()))?;
        validate_image_url(&image_url)?;

        let prompt = prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_ANALYSIS_PROMPT.to_string());

        Ok(Self {
            account_id,
            image_url,
            prompt,
            model: model.into(),
        })
    }
}

/// Maps a requested aspect ratio onto one the upstream model supports.
#[must_use]
pub fn normalize_aspect_ratio(requested: Option<&str>) -> String {
    requested
        .map(str::trim)
        .filter(|r| SUPPORTED_ASPECT_RATIOS.contains(r))
        .unwrap_or(DEFAULT_ASPECT_RATIO)
        .to_string()
}

/// Text-to-image prompts get an explicit English instruction unless they
/// already start with one; otherwise the model tends to answer in prose.
#[must_use]
pub fn shape_prompt(prompt: &str, mode: GenerationMode) -> String {
    match mode {
        GenerationMode::TextToImage if !EXPLICIT_IMAGE_COMMAND.is_match(prompt) => {
            format!("Generate an image: {prompt}")
        }
        _ => prompt.to_string(),
    }
}

/// Checks a reference image URL: `http(s)` URLs pass through, `data:` URLs
/// must be base64 `image/*` payloads within [`MAX_INLINE_IMAGE_BYTES`].
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] describing the problem.
pub fn validate_image_url(url: &str) -> Result<(), GatewayError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(());
    }
    if !url.starts_with("data:") {
        return Err(GatewayError::InvalidRequest(
            "reference image must be an http(s) or data URL".to_string(),
        ));
    }
    let caps = DATA_URL.captures(url).ok_or_else(|| {
        GatewayError::InvalidRequest("reference image data URL is malformed".to_string())
    })?;
    let mime = caps.get(1).map_or("", |m| m.as_str());
    let payload_len = caps.get(2).map_or(0, |m| m.as_str().len());

    if !mime.starts_with("image/") {
        return Err(GatewayError::InvalidRequest(format!(
            "unsupported reference image type: {mime}"
        )));
    }
    let estimated = payload_len / 4 * 3;
    if estimated > MAX_INLINE_IMAGE_BYTES {
        return Err(GatewayError::InvalidRequest(format!(
            "reference image is too large (about {} MiB, limit 7 MiB)",
            estimated / (1024 * 1024)
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn policy() -> GenerationPolicy {
        GenerationPolicy {
            cost: 2,
            default_model: "google/gemini-2.5-flash-image".to_string(),
            allowed_models: vec!["google/gemini-2.5-flash-image".to_string()],
        }
    }

    fn params(prompt: &str, mode: GenerationMode, image_url: Option<&str>) -> GenerationParams {
        GenerationParams {
            prompt: prompt.to_string(),
            mode,
            image_url: image_url.map(str::to_string),
            aspect_ratio: None,
            model: None,
        }
    }

    #[test]
    fn blank_prompt_is_rejected() {
        let result = GenerationRequest::new(
            AccountId::new("u"),
            params("   ", GenerationMode::TextToImage, None),
            &policy(),
        );
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn text_prompt_gets_explicit_instruction() {
        let Ok(req) = GenerationRequest::new(
            AccountId::new("u"),
            params("a cat on the moon", GenerationMode::TextToImage, None),
            &policy(),
        ) else {
            panic!("valid request");
        };
        assert_eq!(req.upstream_prompt, "Generate an image: a cat on the moon");
        assert_eq!(req.cost, 2);
        assert_eq!(req.aspect_ratio, "1:1");
    }

    #[test]
    fn explicit_command_is_left_alone() {
        let shaped = shape_prompt("Create an image of a lighthouse", GenerationMode::TextToImage);
        assert_eq!(shaped, "Create an image of a lighthouse");
        let shaped = shape_prompt("make it blue", GenerationMode::ImageToImage);
        assert_eq!(shaped, "make it blue");
    }

    #[test]
    fn image_mode_requires_reference() {
        let result = GenerationRequest::new(
            AccountId::new("u"),
            params("make it blue", GenerationMode::ImageToImage, None),
            &policy(),
        );
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn text_mode_drops_stray_reference() {
        let Ok(req) = GenerationRequest::new(
            AccountId::new("u"),
            params("a dog", GenerationMode::TextToImage, Some("https://x/y.png")),
            &policy(),
        ) else {
            panic!("valid request");
        };
        assert!(req.image_url.is_none());
    }

    #[test]
    fn data_url_validation() {
        assert!(validate_image_url("data:image/png;base64,iVBORw0KGgo=").is_ok());
        assert!(validate_image_url("data:text/plain;base64,aGVsbG8=").is_err());
        assert!(validate_image_url("data:image/png,raw").is_err());
        assert!(validate_image_url("ftp://example.com/a.png").is_err());
        assert!(validate_image_url("https://example.com/a.png").is_ok());
    }

    #[test]
    fn oversized_data_url_is_rejected() {
        let payload = "A".repeat(MAX_INLINE_IMAGE_BYTES / 3 * 4 + 8);
        let url = format!("data:image/jpeg;base64,{payload}");
        assert!(validate_image_url(&url).is_err());
    }

    #[test]
    fn aspect_ratio_normalization() {
        assert_eq!(normalize_aspect_ratio(Some("16:9")), "16:9");
        assert_eq!(normalize_aspect_ratio(Some("auto")), "1:1");
        assert_eq!(normalize_aspect_ratio(Some("21:9")), "1:1");
        assert_eq!(normalize_aspect_ratio(None), "1:1");
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut p = params("a dog", GenerationMode::TextToImage, None);
        p.model = Some("some/other-model".to_string());
        let result = GenerationRequest::new(AccountId::new("u"), p, &policy());
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn mode_serde_uses_kebab_names() {
        let Ok(mode) = serde_json::from_str::<GenerationMode>("\"image-to-image\"") else {
            panic!("should parse");
        };
        assert_eq!(mode, GenerationMode::ImageToImage);
    }

    #[test]
    fn analysis_defaults_prompt_and_requires_image() {
        let Ok(req) = AnalysisRequest::new(
            AccountId::new("u"),
            Some(" https://cdn.example/cat.png ".to_string()),
            Some("   ".to_string()),
            "google/gemini-2.5-flash-image",
        ) else {
            panic!("valid analysis request");
        };
        assert_eq!(req.prompt, DEFAULT_ANALYSIS_PROMPT);
        assert_eq!(req.image_url, "https://cdn.example/cat.png");

        assert!(matches!(
            AnalysisRequest::new(AccountId::new("u"), None, None, "m"),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(
            AnalysisRequest::new(AccountId::new("u"), Some("ftp://x/y.png".to_string()), None, "m"),
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
