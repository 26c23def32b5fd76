//! Purchase events received from the payment processor.
//!
//! A [`PurchaseEvent`] is recorded the first time a credit-bearing
//! notification arrives and is kept forever: its id is the idempotency key
//! that stops re-delivered webhooks from crediting an account twice.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, BillingPeriod};

/// Processor-assigned identifier of one completed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseEventId(String);

impl PurchaseEventId {
    /// Wraps a processor event id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PurchaseEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing status of a purchase event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    /// Claimed, but the credit has not reached the account yet.
    Unapplied,
    /// Credited exactly once.
    Applied,
}

impl PurchaseStatus {
    /// Returns the database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unapplied => "unapplied",
            Self::Applied => "applied",
        }
    }
}

impl FromStr for PurchaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unapplied" => Ok(Self::Unapplied),
            "applied" => Ok(Self::Applied),
            other => Err(format!("unknown purchase status: {other}")),
        }
    }
}

/// Who a purchase should be credited to, as far as the notification says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseTarget {
    /// Account id from checkout metadata, when present.
    pub account_id: Option<AccountId>,
    /// Customer email, used when the id is missing or unknown.
    pub email: Option<String>,
}

/// One credit-bearing payment notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseEvent {
    /// Idempotency key.
    pub id: PurchaseEventId,
    /// Processor event type (e.g. `checkout.completed`).
    pub event_type: String,
    /// Target as stated in the notification.
    pub target: PurchaseTarget,
    /// Account the credit was (or will be) applied to, once resolved.
    pub account_id: Option<AccountId>,
    /// Plan that was purchased.
    pub plan_id: String,
    /// Billing period of the purchased plan.
    pub billing_period: BillingPeriod,
    /// Credits to grant. Always positive.
    pub amount: i64,
    /// Processing status.
    pub status: PurchaseStatus,
    /// When the notification was first received.
    pub received_at: DateTime<Utc>,
    /// When the credit reached the account.
    pub applied_at: Option<DateTime<Utc>>,
}

impl PurchaseEvent {
    /// Creates a freshly received, not yet applied event.
    #[must_use]
    pub fn received(
        id: PurchaseEventId,
        event_type: impl Into<String>,
        target: PurchaseTarget,
        plan_id: impl Into<String>,
        billing_period: BillingPeriod,
        amount: i64,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            target,
            account_id: None,
            plan_id: plan_id.into(),
            billing_period,
            amount,
            status: PurchaseStatus::Unapplied,
            received_at: Utc::now(),
            applied_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_repr() {
        for status in [PurchaseStatus::Unapplied, PurchaseStatus::Applied] {
            assert_eq!(status.as_str().parse::<PurchaseStatus>().ok(), Some(status));
        }
        assert!("refunded".parse::<PurchaseStatus>().is_err());
    }

    #[test]
    fn received_event_starts_unapplied() {
        let event = PurchaseEvent::received(
            PurchaseEventId::new("evt_1"),
            "checkout.completed",
            PurchaseTarget {
                account_id: None,
                email: Some("a@example.com".into()),
            },
            "basic",
            BillingPeriod::Monthly,
            200,
        );
        assert_eq!(event.status, PurchaseStatus::Unapplied);
        assert!(event.applied_at.is_none());
        assert!(event.account_id.is_none());
    }
}
