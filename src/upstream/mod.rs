//! Outbound clients: hosted auth provider, image-generation and analysis
//! API, payment processor.
//!
//! Each collaborator sits behind a trait so the service layer can be driven
//! by fakes in tests. The concrete clients are built once in the
//! composition root with explicit timeouts.

pub mod auth;
pub mod generation;
pub mod payment;

use std::fmt;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::domain::{AnalysisRequest, GenerationRequest, Identity};
use crate::error::GatewayError;

pub use auth::HostedAuthClient;
pub use generation::ChatImageClient;
pub use payment::{AuthHeaderStyle, CheckoutClient, PaymentClientConfig};

/// Longest upstream body excerpt kept in error details.
const MAX_DETAIL_CHARS: usize = 300;

/// Why an upstream generation call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    /// No response within the configured timeout.
    Timeout,
    /// The upstream asked us to slow down (HTTP 429).
    RateLimited,
    /// The upstream rejected our API credentials.
    Unauthorized,
    /// The upstream rejected the request itself (other 4xx).
    Rejected,
    /// The upstream failed (5xx).
    Unavailable,
    /// Connection-level failure before any response.
    Transport,
    /// A 2xx response that does not match the expected schema.
    MalformedResponse,
}

impl UpstreamErrorKind {
    /// Returns the snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
            Self::Transport => "transport",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed upstream generation call, detailed enough for a client to
/// decide whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct UpstreamFailure {
    /// Failure category.
    pub kind: UpstreamErrorKind,
    /// HTTP status returned by the upstream, if any.
    pub status: Option<u16>,
    /// Short human-readable detail.
    pub detail: String,
}

impl UpstreamFailure {
    /// Creates a failure, truncating overly long details.
    #[must_use]
    pub fn new(kind: UpstreamErrorKind, status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            detail: excerpt(&detail.into()),
        }
    }

    /// Classifies a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            429 => UpstreamErrorKind::RateLimited,
            401 | 403 => UpstreamErrorKind::Unauthorized,
            408 | 504 => UpstreamErrorKind::Timeout,
            400..=499 => UpstreamErrorKind::Rejected,
            _ => UpstreamErrorKind::Unavailable,
        };
        Self::new(kind, Some(status), body)
    }

    /// Classifies a transport-level `reqwest` error.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(UpstreamErrorKind::Timeout, None, err.to_string())
        } else {
            Self::new(UpstreamErrorKind::Transport, None, err.to_string())
        }
    }

    /// Whether the same request may succeed if retried later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            UpstreamErrorKind::Timeout
                | UpstreamErrorKind::RateLimited
                | UpstreamErrorKind::Unavailable
                | UpstreamErrorKind::Transport
        )
    }

    /// HTTP status surfaced to our own client.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self.kind {
            UpstreamErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            UpstreamErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Truncates to [`MAX_DETAIL_CHARS`] characters on a char boundary.
#[must_use]
pub fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((cut, _)) => format!("{}...", trimmed.get(..cut).unwrap_or(trimmed)),
        None => trimmed.to_string(),
    }
}

/// The artifact a successful generation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Image URL (remote or `data:`), returned to the client unchanged.
    pub image_url: String,
    /// Model that produced it.
    pub model: String,
}

/// Text answer of an image-analysis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAnalysis {
    /// The model's description of the image.
    pub analysis: String,
    /// Model that answered.
    pub model: String,
}

/// Parameters of a hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    /// Processor product id.
    pub product_id: String,
    /// Purchasing account id, echoed back in webhook metadata.
    pub account_id: String,
    /// Purchasing account email.
    pub email: Option<String>,
    /// Plan id, echoed back in webhook metadata.
    pub plan_id: String,
    /// Billing period, echoed back in webhook metadata.
    pub billing_period: String,
    /// Our idempotency key for the session-creation call.
    pub request_id: String,
}

/// A created checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    /// Processor session id.
    pub session_id: String,
    /// Hosted checkout page; surfaced to the client unchanged.
    pub checkout_url: String,
}

/// Processor-reported state of a checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutStatus {
    /// Processor session id.
    pub session_id: String,
    /// Raw processor status string.
    pub status: String,
    /// Whether the processor considers the session paid.
    pub paid: bool,
}

/// Resolves bearer credentials to caller identities.
#[async_trait]
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    /// Returns the identity behind `bearer_token`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Unauthenticated`] for invalid or expired tokens,
    /// [`GatewayError::AuthUnavailable`] when the provider cannot answer.
    async fn resolve(&self, bearer_token: &str) -> Result<Identity, GatewayError>;
}

/// Produces images from validated generation requests.
#[async_trait]
pub trait ImageGenerator: Send + Sync + fmt::Debug {
    /// Runs one generation.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamFailure`] on timeout, non-2xx status, transport
    /// failure, or a response without an image.
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, UpstreamFailure>;
}

/// Describes images in text.
#[async_trait]
pub trait ImageAnalyzer: Send + Sync + fmt::Debug {
    /// Asks the model about one image.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamFailure`] on timeout, non-2xx status, transport
    /// failure, or a response without text.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<ImageAnalysis, UpstreamFailure>;
}

/// Payment-processor session API.
#[async_trait]
pub trait PaymentGateway: Send + Sync + fmt::Debug {
    /// Creates a hosted checkout session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PaymentProvider`] if the processor fails or
    /// answers with an unexpected shape.
    async fn create_checkout(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    /// Looks up a checkout session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PaymentProvider`] if the lookup fails.
    async fn checkout_status(&self, session_id: &str) -> Result<CheckoutStatus, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            UpstreamFailure::from_status(429, "").kind,
            UpstreamErrorKind::RateLimited
        );
        assert_eq!(
            UpstreamFailure::from_status(401, "").kind,
            UpstreamErrorKind::Unauthorized
        );
        assert_eq!(
            UpstreamFailure::from_status(422, "").kind,
            UpstreamErrorKind::Rejected
        );
        assert_eq!(
            UpstreamFailure::from_status(503, "").kind,
            UpstreamErrorKind::Unavailable
        );
        assert_eq!(
            UpstreamFailure::from_status(504, "").kind,
            UpstreamErrorKind::Timeout
        );
    }

    #[test]
    fn retryability() {
        assert!(UpstreamFailure::from_status(429, "").is_retryable());
        assert!(UpstreamFailure::from_status(500, "").is_retryable());
        assert!(!UpstreamFailure::from_status(400, "").is_retryable());
        assert!(!UpstreamFailure::from_status(401, "").is_retryable());
        assert!(
            !UpstreamFailure::new(UpstreamErrorKind::MalformedResponse, Some(200), "")
                .is_retryable()
        );
    }

    #[test]
    fn long_details_are_truncated() {
        let long = "é".repeat(1000);
        let failure = UpstreamFailure::new(UpstreamErrorKind::Rejected, Some(400), long);
        assert_eq!(failure.detail.chars().count(), MAX_DETAIL_CHARS + 3);
    }
}
