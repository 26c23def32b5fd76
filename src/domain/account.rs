//! Credits account and authenticated caller identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Tier label assigned to freshly provisioned accounts.
pub const DEFAULT_TIER: &str = "free";

/// A caller identity as resolved from a bearer credential by the hosted
/// auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Auth provider subject.
    pub account_id: AccountId,
    /// Email on record with the auth provider, if any.
    pub email: Option<String>,
}

impl Identity {
    /// Creates a new identity.
    #[must_use]
    pub fn new(account_id: AccountId, email: Option<String>) -> Self {
        Self { account_id, email }
    }
}

/// Persistent per-user balance record.
///
/// Created on first successful authentication and mutated only through the
/// ledger operations. `credits` is never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Unique email, used as a fallback lookup key by purchase webhooks.
    pub email: Option<String>,
    /// Spendable balance.
    pub credits: i64,
    /// Informational tier label (e.g. the last purchased plan).
    pub tier: String,
    /// Provisioning timestamp.
    pub created_at: DateTime<Utc>,
    /// Last balance mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Creates an account with the given opening balance.
    #[must_use]
    pub fn new(id: AccountId, email: Option<String>, credits: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            email: email.map(|e| normalize_email(&e)),
            credits,
            tier: DEFAULT_TIER.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lower-cases and trims an email so lookups are case-insensitive.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
