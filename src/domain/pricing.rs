//! Authoritative pricing table.
//!
//! One table decides both what a generation costs and how many credits each
//! purchasable plan grants. Every handler reads from the same
//! [`PricingTable`]; nothing else hard-codes a price.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Credits charged per image generation unless configured otherwise.
pub const DEFAULT_GENERATION_COST: i64 = 2;

/// Billing cadence of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    /// Billed every month.
    Monthly,
    /// Billed once a year.
    Yearly,
}

impl BillingPeriod {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingPeriod {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(Self::Monthly),
            "yearly" | "year" | "annual" => Ok(Self::Yearly),
            other => Err(PricingError::UnknownBillingPeriod(other.to_string())),
        }
    }
}

/// A purchasable combination of plan and billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PlanOffer {
    /// Plan identifier (`basic`, `pro`, `max`).
    pub plan_id: String,
    /// Billing cadence.
    pub billing_period: BillingPeriod,
    /// Credits granted when a purchase of this offer is confirmed.
    pub credits: i64,
    /// Payment-processor product id. Offers without one cannot be sold
    /// through checkout but are still honored by webhooks.
    #[serde(default)]
    pub product_id: Option<String>,
}

/// Pricing configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    /// Billing period string not recognised.
    #[error("unknown billing period: {0}")]
    UnknownBillingPeriod(String),
    /// Pricing file could not be read.
    #[error("cannot read pricing table: {0}")]
    Io(#[from] std::io::Error),
    /// Pricing file is not valid JSON for a [`PricingTable`].
    #[error("cannot parse pricing table: {0}")]
    Parse(#[from] serde_json::Error),
    /// Table contents violate an invariant.
    #[error("invalid pricing table: {0}")]
    Invalid(String),
}

/// Generation cost plus the catalog of plan offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PricingTable {
    /// Credits charged per generation request.
    pub generation_cost: i64,
    /// Purchasable offers.
    pub offers: Vec<PlanOffer>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let offer = |plan: &str, period, credits, product: Option<&str>| PlanOffer {
            plan_id: plan.to_string(),
            billing_period: period,
            credits,
            product_id: product.map(str::to_string),
        };
        Self {
            generation_cost: DEFAULT_GENERATION_COST,
            offers: vec![
                offer("basic", BillingPeriod::Monthly, 200, None),
                offer(
                    "basic",
                    BillingPeriod::Yearly,
                    2400,
                    Some("prod_2U14J3cNweMcQPQaQiTHTt"),
                ),
                offer("pro", BillingPeriod::Monthly, 800, None),
                offer(
                    "pro",
                    BillingPeriod::Yearly,
                    9600,
                    Some("prod_3GUDoBE0DSES3HGqYDC1S"),
                ),
                offer("max", BillingPeriod::Monthly, 3600, None),
                offer(
                    "max",
                    BillingPeriod::Yearly,
                    43200,
                    Some("prod_42aqCZ9KQG1nScBkhK6m10"),
                ),
            ],
        }
    }
}

impl PricingTable {
    /// Loads a pricing table from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`PricingError`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PricingError> {
        let raw = std::fs::read_to_string(path)?;
        let table: Self = serde_json::from_str(&raw)?;
        table.validate()?;
        Ok(table)
    }

    /// Overrides the generation cost.
    #[must_use]
    pub fn with_generation_cost(mut self, cost: i64) -> Self {
        self.generation_cost = cost;
        self
    }

    /// Checks that every price is positive and that plan/period pairs and
    /// product ids are unique.
    ///
    /// # Errors
    ///
    /// Returns [`PricingError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), PricingError> {
        if self.generation_cost <= 0 {
            return Err(PricingError::Invalid(
                "generation_cost must be positive".to_string(),
            ));
        }
        for (i, offer) in self.offers.iter().enumerate() {
            if offer.credits <= 0 {
                return Err(PricingError::Invalid(format!(
                    "offer {}/{} grants non-positive credits",
                    offer.plan_id, offer.billing_period
                )));
            }
            let duplicate = self.offers.iter().skip(i + 1).any(|other| {
                (other.plan_id == offer.plan_id && other.billing_period == offer.billing_period)
                    || (offer.product_id.is_some() && other.product_id == offer.product_id)
            });
            if duplicate {
                return Err(PricingError::Invalid(format!(
                    "duplicate offer for {}/{}",
                    offer.plan_id, offer.billing_period
                )));
            }
        }
        Ok(())
    }

    /// Looks up an offer by plan id and billing period.
    #[must_use]
    pub fn offer_for_plan(&self, plan_id: &str, period: BillingPeriod) -> Option<&PlanOffer> {
        self.offers
            .iter()
            .find(|o| o.plan_id == plan_id && o.billing_period == period)
    }

    /// Looks up an offer by payment-processor product id.
    #[must_use]
    pub fn offer_for_product(&self, product_id: &str) -> Option<&PlanOffer> {
        self.offers
            .iter()
            .find(|o| o.product_id.as_deref() == Some(product_id))
    }

    /// Resolves the offer a purchase notification refers to.
    ///
    /// Plan metadata wins over the product id; a plan without a billing
    /// period is not enough on its own.
    #[must_use]
    pub fn resolve(
        &self,
        plan_id: Option<&str>,
        period: Option<BillingPeriod>,
        product_id: Option<&str>,
    ) -> Option<&PlanOffer> {
        if let (Some(plan), Some(period)) = (plan_id, period)
            && let Some(offer) = self.offer_for_plan(plan, period)
        {
            return Some(offer);
        }
        product_id.and_then(|p| self.offer_for_product(p))
    }
}
