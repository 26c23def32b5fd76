//! DTOs for account and admin endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::Account;

/// Caller's ledger record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    /// Account id.
    pub account_id: String,
    /// Account email.
    pub email: Option<String>,
    /// Current balance.
    pub credits: i64,
    /// Informational tier label.
    pub tier: String,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            account_id: account.id.into(),
            email: account.email,
            credits: account.credits,
            tier: account.tier,
        }
    }
}

/// Request body for an operator balance adjustment.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdjustBalanceRequest {
    /// Credits to add (negative to remove).
    pub delta: i64,
    /// When set, the adjustment only applies if the balance still equals
    /// this value.
    #[serde(default)]
    pub expected_balance: Option<i64>,
}

/// Result of an operator balance adjustment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdjustBalanceResponse {
    /// Account id.
    pub account_id: String,
    /// Balance after the adjustment.
    pub credits: i64,
}
