//! Payment-processor client: checkout session creation and lookup.
//!
//! A single [`PaymentClientConfig`] chosen at startup decides the base URL
//! and how the API key is presented, so test and live processor
//! environments differ only in configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{
    excerpt, CheckoutSession, CheckoutSessionRequest, CheckoutStatus, PaymentGateway,
};
use crate::error::GatewayError;

/// How the processor API key is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthHeaderStyle {
    /// `x-api-key: <key>`.
    ApiKeyHeader,
    /// `Authorization: Bearer <key>`.
    Bearer,
}

impl FromStr for AuthHeaderStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x-api-key" | "api-key" | "apikey" => Ok(Self::ApiKeyHeader),
            "bearer" => Ok(Self::Bearer),
            other => Err(format!("unknown payment auth style: {other}")),
        }
    }
}

impl fmt::Display for AuthHeaderStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKeyHeader => f.write_str("x-api-key"),
            Self::Bearer => f.write_str("bearer"),
        }
    }
}

/// Connection settings for the payment processor.
#[derive(Debug, Clone)]
pub struct PaymentClientConfig {
    /// API root, e.g. `https://api.creem.io`.
    pub base_url: String,
    /// How the API key is presented.
    pub auth_header_style: AuthHeaderStyle,
    /// Processor API key.
    pub api_key: SecretString,
    /// Where the processor sends the buyer after payment.
    pub success_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct CreateCheckoutBody<'a> {
    product_id: &'a str,
    request_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    success_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer: Option<Customer<'a>>,
    metadata: CheckoutMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct Customer<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct CheckoutMetadata<'a> {
    user_id: &'a str,
    plan_id: &'a str,
    billing_period: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckoutResponse {
    id: String,
    #[serde(default)]
    checkout_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
}

/// Session ids are interpolated into a URL path; keep them to a safe
/// alphabet.
fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// HTTP client for the payment processor.
#[derive(Debug, Clone)]
pub struct CheckoutClient {
    config: PaymentClientConfig,
    client: Client,
}

impl CheckoutClient {
    /// Builds a client from `config`.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the HTTP client cannot be built.
    pub fn new(mut config: PaymentClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { config, client })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let key = self.config.api_key.expose_secret();
        match self.config.auth_header_style {
            AuthHeaderStyle::ApiKeyHeader => builder.header("x-api-key", key),
            AuthHeaderStyle::Bearer => builder.bearer_auth(key),
        }
    }

    async fn read_session(resp: reqwest::Response) -> Result<CheckoutResponse, GatewayError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::PaymentProvider(format!(
                "processor returned {status}: {}",
                excerpt(&body)
            )));
        }
        resp.json::<CheckoutResponse>()
            .await
            .map_err(|e| GatewayError::PaymentProvider(format!("unexpected checkout payload: {e}")))
    }
}

#[async_trait]
impl PaymentGateway for CheckoutClient {
    async fn create_checkout(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let body = CreateCheckoutBody {
            product_id: &request.product_id,
            request_id: &request.request_id,
            success_url: self.config.success_url.as_deref(),
            customer: request.email.as_deref().map(|email| Customer { email }),
            metadata: CheckoutMetadata {
                user_id: &request.account_id,
                plan_id: &request.plan_id,
                billing_period: &request.billing_period,
            },
        };
        let resp = self
            .authorize(
                self.client
                    .post(format!("{}/v1/checkouts", self.config.base_url)),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::PaymentProvider(e.to_string()))?;

        let session = Self::read_session(resp).await?;
        let checkout_url = session.checkout_url.or(session.url).ok_or_else(|| {
            GatewayError::PaymentProvider("checkout response has no redirect url".to_string())
        })?;
        Ok(CheckoutSession {
            session_id: session.id,
            checkout_url,
        })
    }

    async fn checkout_status(&self, session_id: &str) -> Result<CheckoutStatus, GatewayError> {
        if !is_valid_session_id(session_id) {
            return Err(GatewayError::InvalidRequest(
                "session_id is malformed".to_string(),
            ));
        }
        let resp = self
            .authorize(
                self.client
                    .get(format!("{}/v1/checkouts/{session_id}", self.config.base_url)),
            )
            .send()
            .await
            .map_err(|e| GatewayError::PaymentProvider(e.to_string()))?;

        let session = Self::read_session(resp).await?;
        let status = session.status.unwrap_or_default();
        let paid = status == "completed" || session.payment_status.as_deref() == Some("paid");
        Ok(CheckoutStatus {
            session_id: session.id,
            status,
            paid,
        })
    }
}
