//! Database models for ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::AccountId;

/// A generation whose artifact was returned to the client although its
/// debit lost a race. Stored in the `billing_discrepancies` table.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BillingDiscrepancy {
    /// Row id.
    pub id: Uuid,
    /// Account that was not charged.
    #[schema(value_type = String)]
    pub account_id: AccountId,
    /// Generation request id (also present in the logs).
    pub request_id: Uuid,
    /// Credits that should have been debited.
    pub cost: i64,
    /// Balance observed when the debit was refused.
    pub observed_balance: i64,
    /// Upstream model that produced the artifact.
    pub model: String,
    /// When the discrepancy was recorded.
    pub created_at: DateTime<Utc>,
}

/// Insert form of [`BillingDiscrepancy`].
#[derive(Debug, Clone)]
pub struct NewDiscrepancy {
    /// Account that was not charged.
    pub account_id: AccountId,
    /// Generation request id.
    pub request_id: Uuid,
    /// Credits that should have been debited.
    pub cost: i64,
    /// Balance observed when the debit was refused.
    pub observed_balance: i64,
    /// Upstream model that produced the artifact.
    pub model: String,
}
