//! Request extractors for caller identity and admin access.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use secrecy::ExposeSecret;

use crate::app_state::AppState;
use crate::domain::{Account, Identity};
use crate::error::GatewayError;
use crate::signature::{bearer_token, constant_time_eq};

fn bearer_from_parts(parts: &Parts) -> Result<&str, GatewayError> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| GatewayError::Unauthenticated("missing bearer token".to_string()))
}

/// An authenticated caller whose account is guaranteed to exist.
///
/// Resolving the bearer token through the identity provider is the
/// `Authenticated` step of every metered request. The account is
/// provisioned on first sight.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Caller identity.
    pub identity: Identity,
    /// Ledger record at authentication time.
    pub account: Account,
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_from_parts(parts)?;
        let identity = state.identity.resolve(token).await?;
        let account = state.ledger.ensure_account(&identity).await?;
        Ok(Self { identity, account })
    }
}

/// Guard for operator routes: the bearer token must equal `ADMIN_TOKEN`.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.admin_token else {
            return Err(GatewayError::Unauthenticated(
                "admin access is disabled".to_string(),
            ));
        };
        let token = bearer_from_parts(parts)?;
        if constant_time_eq(token, expected.expose_secret()) {
            Ok(Self)
        } else {
            tracing::warn!("rejected admin request with wrong token");
            Err(GatewayError::Unauthenticated("invalid admin token".to_string()))
        }
    }
}
