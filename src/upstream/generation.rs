//! Chat-completions image client.
//!
//! Talks to an OpenAI-compatible `/chat/completions` endpoint. Generation
//! returns images in `choices[0].message.images`; analysis returns text in
//! `choices[0].message.content`. Responses are parsed against a strict
//! schema and a missing image or answer is a
//! [`UpstreamErrorKind::MalformedResponse`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{
    GeneratedImage, ImageAnalysis, ImageAnalyzer, ImageGenerator, UpstreamErrorKind,
    UpstreamFailure,
};
use crate::domain::{AnalysisRequest, GenerationMode, GenerationRequest};

const TEXT_TO_IMAGE_MODALITIES: &[&str] = &["image"];
const IMAGE_TO_IMAGE_MODALITIES: &[&str] = &["image", "text"];

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    modalities: Option<&'static [&'static str]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_config: Option<ImageConfig<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    ImageUrl { image_url: UrlRef<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct UrlRef<'a> {
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct ImageConfig<'a> {
    aspect_ratio: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    images: Vec<ResponseImage>,
}

#[derive(Debug, Deserialize)]
struct ResponseImage {
    image_url: ResponseUrl,
}

#[derive(Debug, Deserialize)]
struct ResponseUrl {
    url: String,
}

/// Error envelope some providers return with a 200 status.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

/// Builds the upstream request body for `request`.
fn chat_request(request: &GenerationRequest) -> ChatRequest<'_> {
    let mut content = Vec::with_capacity(2);
    if let Some(url) = request.image_url.as_deref() {
        content.push(ContentPart::ImageUrl {
            image_url: UrlRef { url },
        });
    }
    content.push(ContentPart::Text {
        text: &request.upstream_prompt,
    });
    ChatRequest {
        model: &request.model,
        messages: [ChatMessage {
            role: "user",
            content,
        }],
        modalities: Some(match request.mode {
            GenerationMode::TextToImage => TEXT_TO_IMAGE_MODALITIES,
            GenerationMode::ImageToImage => IMAGE_TO_IMAGE_MODALITIES,
        }),
        image_config: Some(ImageConfig {
            aspect_ratio: &request.aspect_ratio,
        }),
    }
}

/// Question first, then the image.
fn analysis_request(request: &AnalysisRequest) -> ChatRequest<'_> {
    ChatRequest {
        model: &request.model,
        messages: [ChatMessage {
            role: "user",
            content: vec![
                ContentPart::Text {
                    text: &request.prompt,
                },
                ContentPart::ImageUrl {
                    image_url: UrlRef {
                        url: &request.image_url,
                    },
                },
            ],
        }],
        modalities: None,
        image_config: None,
    }
}

/// Extracts the first message from a 2xx body.
fn first_message(body: &str) -> Result<ResponseMessage, UpstreamFailure> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        let status = envelope.error.code.unwrap_or(502);
        return Err(UpstreamFailure::from_status(status, &envelope.error.message));
    }

    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        UpstreamFailure::new(
            UpstreamErrorKind::MalformedResponse,
            Some(200),
            format!("unexpected response shape: {e}"),
        )
    })?;

    parsed.choices.into_iter().next().map(|c| c.message).ok_or_else(|| {
        UpstreamFailure::new(
            UpstreamErrorKind::MalformedResponse,
            Some(200),
            "response has no choices",
        )
    })
}

/// Extracts the first image from a 2xx body.
fn parse_image(body: &str, model: &str) -> Result<GeneratedImage, UpstreamFailure> {
    let message = first_message(body)?;
    match message.images.into_iter().next() {
        Some(image) if !image.image_url.url.is_empty() => Ok(GeneratedImage {
            image_url: image.image_url.url,
            model: model.to_string(),
        }),
        _ => {
            let text = message.content.unwrap_or_default();
            Err(UpstreamFailure::new(
                UpstreamErrorKind::MalformedResponse,
                Some(200),
                if text.trim().is_empty() {
                    "model returned no image".to_string()
                } else {
                    format!("model returned text instead of an image: {text}")
                },
            ))
        }
    }
}

/// Extracts the text answer from a 2xx body.
fn parse_analysis(body: &str, model: &str) -> Result<ImageAnalysis, UpstreamFailure> {
    let analysis = first_message(body)?
        .content
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| {
            UpstreamFailure::new(
                UpstreamErrorKind::MalformedResponse,
                Some(200),
                "model returned no analysis",
            )
        })?;
    Ok(ImageAnalysis {
        analysis,
        model: model.to_string(),
    })
}

/// HTTP client for the image generation and analysis API.
#[derive(Debug, Clone)]
pub struct ChatImageClient {
    base_url: String,
    api_key: SecretString,
    site_url: String,
    site_name: String,
    client: Client,
}

impl ChatImageClient {
    /// Builds a client. `timeout` bounds every call end to end.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        site_url: impl Into<String>,
        site_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            site_url: site_url.into(),
            site_name: site_name.into(),
            client,
        })
    }

    /// Posts one chat completion and returns the 2xx body.
    async fn complete(&self, payload: &ChatRequest<'_>) -> Result<String, UpstreamFailure> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("HTTP-Referer", &self.site_url)
            .header("X-Title", &self.site_name)
            .json(payload)
            .send()
            .await
            .map_err(|e| UpstreamFailure::from_transport(&e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| UpstreamFailure::from_transport(&e))?;

        if !status.is_success() {
            return Err(UpstreamFailure::from_status(status.as_u16(), &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl ImageGenerator for ChatImageClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, UpstreamFailure> {
        let body = self.complete(&chat_request(request)).await?;
        parse_image(&body, &request.model)
    }
}

#[async_trait]
impl ImageAnalyzer for ChatImageClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<ImageAnalysis, UpstreamFailure> {
        let body = self.complete(&analysis_request(request)).await?;
        parse_analysis(&body, &request.model)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::AccountId;
    use crate::domain::generation::DEFAULT_ANALYSIS_PROMPT;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "google/gemini-2.5-flash-image";

    fn request(mode: GenerationMode, image_url: Option<&str>) -> GenerationRequest {
        GenerationRequest {
            account_id: AccountId::new("u1"),
            prompt: "a red fox".to_string(),
            upstream_prompt: "Generate an image: a red fox".to_string(),
            mode,
            image_url: image_url.map(str::to_string),
            aspect_ratio: "16:9".to_string(),
            model: MODEL.to_string(),
            cost: 2,
        }
    }

    fn client(server: &MockServer, timeout: Duration) -> ChatImageClient {
        let Ok(client) = ChatImageClient::new(
            server.uri(),
            SecretString::from("sk-test"),
            "https://banana.example",
            "Banana",
            timeout,
        ) else {
            panic!("client builds");
        };
        client
    }

    fn image_body(url: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Here is your image",
                    "images": [{"type": "image_url", "image_url": {"url": url}}]
                }
            }]
        })
    }

    #[test]
    fn request_body_shape() {
        let req = request(GenerationMode::ImageToImage, Some("https://x/ref.png"));
        let Ok(value) = serde_json::to_value(chat_request(&req)) else {
            panic!("serializes");
        };
        assert_eq!(value["model"], MODEL);
        assert_eq!(value["image_config"]["aspect_ratio"], "16:9");
        assert_eq!(value["modalities"], serde_json::json!(["image", "text"]));
        assert_eq!(value["messages"][0]["content"][0]["type"], "image_url");
        assert_eq!(
            value["messages"][0]["content"][0]["image_url"]["url"],
            "https://x/ref.png"
        );
        assert_eq!(value["messages"][0]["content"][1]["type"], "text");

        let text_only = request(GenerationMode::TextToImage, None);
        let Ok(value) = serde_json::to_value(chat_request(&text_only)) else {
            panic!("serializes");
        };
        assert_eq!(value["modalities"], serde_json::json!(["image"]));
        assert_eq!(value["messages"][0]["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn returns_first_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("x-title", "Banana"))
            .and(body_partial_json(serde_json::json!({"model": MODEL})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(image_body("data:image/png;base64,AAAA")),
            )
            .mount(&server)
            .await;

        let result = client(&server, Duration::from_secs(2))
            .generate(&request(GenerationMode::TextToImage, None))
            .await;
        let Ok(image) = result else {
            panic!("expected image, got {result:?}");
        };
        assert_eq!(image.image_url, "data:image/png;base64,AAAA");
        assert_eq!(image.model, MODEL);
    }

    #[tokio::test]
    async fn text_only_answer_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "I cannot draw that"}}]
            })))
            .mount(&server)
            .await;

        let Err(failure) = client(&server, Duration::from_secs(2))
            .generate(&request(GenerationMode::TextToImage, None))
            .await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, UpstreamErrorKind::MalformedResponse);
        assert!(failure.detail.contains("I cannot draw that"));
    }

    fn analysis(image_url: &str) -> AnalysisRequest {
        let Ok(req) = AnalysisRequest::new(
            AccountId::new("u1"),
            Some(image_url.to_string()),
            None,
            MODEL,
        ) else {
            panic!("valid analysis request");
        };
        req
    }

    #[test]
    fn analysis_body_sends_question_then_image() {
        let req = analysis("https://x/cat.png");
        let Ok(value) = serde_json::to_value(analysis_request(&req)) else {
            panic!("serializes");
        };
        assert_eq!(value["messages"][0]["content"][0]["type"], "text");
        assert_eq!(
            value["messages"][0]["content"][0]["text"],
            DEFAULT_ANALYSIS_PROMPT
        );
        assert_eq!(
            value["messages"][0]["content"][1]["image_url"]["url"],
            "https://x/cat.png"
        );
        assert!(value.get("modalities").is_none());
        assert!(value.get("image_config").is_none());
    }

    #[tokio::test]
    async fn analysis_returns_text_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": MODEL})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": " A cat on a sofa. "}}]
            })))
            .mount(&server)
            .await;

        let result = client(&server, Duration::from_secs(2))
            .analyze(&analysis("https://x/cat.png"))
            .await;
        let Ok(answer) = result else {
            panic!("expected analysis, got {result:?}");
        };
        assert_eq!(answer.analysis, "A cat on a sofa.");
        assert_eq!(answer.model, MODEL);
    }

    #[tokio::test]
    async fn empty_analysis_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": ""}}]
            })))
            .mount(&server)
            .await;

        let Err(failure) = client(&server, Duration::from_secs(2))
            .analyze(&analysis("https://x/cat.png"))
            .await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, UpstreamErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn rate_limit_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let Err(failure) = client(&server, Duration::from_secs(2))
            .generate(&request(GenerationMode::TextToImage, None))
            .await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, UpstreamErrorKind::RateLimited);
        assert_eq!(failure.status, Some(429));
        assert!(failure.is_retryable());
    }

    #[tokio::test]
    async fn error_envelope_with_ok_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"message": "provider overloaded", "code": 503}
            })))
            .mount(&server)
            .await;

        let Err(failure) = client(&server, Duration::from_secs(2))
            .generate(&request(GenerationMode::TextToImage, None))
            .await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, UpstreamErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(image_body("https://cdn/x.png"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let Err(failure) = client(&server, Duration::from_millis(100))
            .generate(&request(GenerationMode::TextToImage, None))
            .await
        else {
            panic!("expected timeout");
        };
        assert_eq!(failure.kind, UpstreamErrorKind::Timeout);
    }
}
