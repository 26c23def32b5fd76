//! Hosted auth provider client.
//!
//! Session issuance and OAuth happen entirely at the provider; this client
//! only asks it who a bearer token belongs to (`GET /auth/v1/user`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::IdentityProvider;
use crate::domain::{AccountId, Identity};
use crate::error::GatewayError;

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// HTTP client for the hosted auth provider's user endpoint.
#[derive(Debug, Clone)]
pub struct HostedAuthClient {
    base_url: String,
    api_key: SecretString,
    client: Client,
}

impl HostedAuthClient {
    /// Builds a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl IdentityProvider for HostedAuthClient {
    async fn resolve(&self, bearer_token: &str) -> Result<Identity, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(|e| GatewayError::AuthUnavailable(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GatewayError::Unauthenticated(
                "session is invalid or expired".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(GatewayError::AuthUnavailable(format!(
                "auth provider returned {status}"
            )));
        }

        let user: UserResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::AuthUnavailable(format!("unexpected user payload: {e}")))?;
        if user.id.trim().is_empty() {
            return Err(GatewayError::Unauthenticated(
                "session has no subject".to_string(),
            ));
        }
        Ok(Identity::new(AccountId::new(user.id), user.email))
    }
}
