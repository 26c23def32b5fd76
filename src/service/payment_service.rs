//! Payment service: purchase webhooks and checkout sessions.
//!
//! Webhooks are at-least-once and unordered. A notification is verified,
//! priced through the [`PricingTable`], and handed to
//! [`LedgerService::apply_purchase`], whose idempotency guard makes
//! re-deliveries harmless.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use uuid::Uuid;

use super::LedgerService;
use crate::domain::{
    AccountId, BillingPeriod, Identity, PricingTable, PurchaseEvent, PurchaseEventId,
    PurchaseTarget,
};
use crate::error::GatewayError;
use crate::persistence::CreditOutcome;
use crate::signature::verify_hmac_sha256_hex;
use crate::upstream::{CheckoutSession, CheckoutSessionRequest, CheckoutStatus, PaymentGateway};

/// Event types that grant credits.
pub const CREDIT_BEARING_EVENTS: [&str; 2] = ["checkout.completed", "subscription.paid"];

/// Event type that ends a subscription and resets the plan tier.
pub const CANCELLATION_EVENT: &str = "subscription.canceled";

/// Purchase notification as sent by the processor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    /// Processor event id.
    #[serde(default)]
    pub id: Option<String>,
    /// Event type.
    #[serde(default)]
    pub event: Option<String>,
    /// Event type, alternative field name.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Event body.
    #[serde(default)]
    pub data: WebhookData,
}

/// Body of a purchase notification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookData {
    /// Object id, used as the event id when the envelope has none.
    #[serde(default)]
    pub id: Option<String>,
    /// Buyer email.
    #[serde(default)]
    pub customer_email: Option<String>,
    /// Buyer object, for processors that nest the email.
    #[serde(default)]
    pub customer: Option<WebhookCustomer>,
    /// Purchased product.
    #[serde(default)]
    pub product_id: Option<String>,
    /// Metadata we attached when creating the checkout.
    #[serde(default)]
    pub metadata: Option<WebhookMetadata>,
}

/// Nested buyer object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookCustomer {
    /// Buyer email.
    #[serde(default)]
    pub email: Option<String>,
}

/// Checkout metadata echoed back by the processor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookMetadata {
    /// Our account id.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Plan id.
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Billing period.
    #[serde(default)]
    pub billing_period: Option<String>,
}

impl WebhookPayload {
    /// The event type, from `event` or `type`.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.event.as_deref().or(self.kind.as_deref())
    }

    /// The processor event id: envelope id first, object id second.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.data.id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }

    fn metadata(&self) -> WebhookMetadata {
        self.data.metadata.clone().unwrap_or_default()
    }

    fn customer_email(&self) -> Option<String> {
        self.data
            .customer_email
            .clone()
            .or_else(|| self.data.customer.as_ref().and_then(|c| c.email.clone()))
            .filter(|e| !e.trim().is_empty())
    }

    /// Buyer named by the metadata account id and the customer email.
    fn buyer(&self) -> PurchaseTarget {
        PurchaseTarget {
            account_id: self
                .metadata()
                .user_id
                .filter(|id| !id.trim().is_empty())
                .map(AccountId::new),
            email: self.customer_email(),
        }
    }
}

/// What a webhook delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Credits were granted now.
    Credited {
        /// Credited account.
        account_id: AccountId,
        /// Credits granted.
        amount: i64,
        /// Balance after the credit.
        new_balance: i64,
    },
    /// Claimed, but the buyer has no account yet.
    Pending,
    /// A re-delivery of an event already claimed.
    Duplicate,
    /// A subscription cancellation reset the account's tier.
    Canceled {
        /// Account whose tier was reset.
        account_id: AccountId,
    },
    /// A credit-bearing event that cannot be priced or attributed. It is
    /// acknowledged so the processor stops retrying, and nothing is claimed.
    Rejected {
        /// Why the event was not applied.
        reason: String,
    },
    /// Not an event type this service acts on, or a cancellation for an
    /// unknown buyer.
    Ignored,
}

impl WebhookOutcome {
    /// Short status label for the acknowledgement body.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Credited { .. } => "credited",
            Self::Pending => "pending",
            Self::Duplicate => "duplicate",
            Self::Canceled { .. } => "canceled",
            Self::Rejected { .. } => "rejected",
            Self::Ignored => "ignored",
        }
    }
}

/// Payment flows: webhooks, checkout creation, checkout verification.
#[derive(Debug, Clone)]
pub struct PaymentService {
    ledger: Arc<LedgerService>,
    gateway: Arc<dyn PaymentGateway>,
    pricing: Arc<PricingTable>,
    webhook_secret: Option<SecretString>,
}

impl PaymentService {
    /// Creates a payment service. Without a `webhook_secret`, signatures
    /// are not checked.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerService>,
        gateway: Arc<dyn PaymentGateway>,
        pricing: Arc<PricingTable>,
        webhook_secret: Option<SecretString>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            pricing,
            webhook_secret,
        }
    }

    /// Returns the pricing table.
    #[must_use]
    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Verifies the webhook signature header against the raw body.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthenticated`] if a secret is configured
    /// and the signature is missing or wrong.
    pub fn verify_signature(&self, body: &[u8], signature: Option<&str>) -> Result<(), GatewayError> {
        let Some(secret) = &self.webhook_secret else {
            return Ok(());
        };
        let signature = signature.ok_or_else(|| {
            GatewayError::Unauthenticated("missing webhook signature".to_string())
        })?;
        if verify_hmac_sha256_hex(secret.expose_secret().as_bytes(), body, signature) {
            Ok(())
        } else {
            tracing::warn!("webhook signature mismatch");
            Err(GatewayError::Unauthenticated(
                "invalid webhook signature".to_string(),
            ))
        }
    }

    /// Turns a credit-bearing payload into a priced purchase event.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] when the event id, buyer, or
    /// plan cannot be determined.
    pub fn purchase_event(&self, payload: &WebhookPayload) -> Result<PurchaseEvent, GatewayError> {
        let event_type = payload.event_type().unwrap_or_default();
        let event_id = payload.event_id().ok_or_else(|| {
            GatewayError::InvalidRequest("purchase notification has no event id".to_string())
        })?;

        let metadata = payload.metadata();
        let period = match metadata.billing_period.as_deref() {
            Some(raw) => Some(
                raw.parse::<BillingPeriod>()
                    .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?,
            ),
            None => None,
        };
        let offer = self
            .pricing
            .resolve(
                metadata.plan_id.as_deref(),
                period,
                payload.data.product_id.as_deref(),
            )
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "no offer matches plan {:?} / product {:?}",
                    metadata.plan_id, payload.data.product_id
                ))
            })?;

        let target = payload.buyer();
        if target.account_id.is_none() && target.email.is_none() {
            return Err(GatewayError::InvalidRequest(
                "purchase notification names no buyer".to_string(),
            ));
        }

        Ok(PurchaseEvent::received(
            PurchaseEventId::new(event_id),
            event_type,
            target,
            offer.plan_id.clone(),
            offer.billing_period,
            offer.credits,
        ))
    }

    /// Processes one verified webhook delivery.
    ///
    /// A credit-bearing payload that cannot be priced or attributed is
    /// logged at error level and returned as [`WebhookOutcome::Rejected`].
    ///
    /// # Errors
    ///
    /// A persistence error if the claim could not be stored (the processor
    /// should re-deliver).
    pub async fn handle_webhook(&self, payload: &WebhookPayload) -> Result<WebhookOutcome, GatewayError> {
        let event_type = payload.event_type().unwrap_or_default();
        if event_type == CANCELLATION_EVENT {
            return self.cancel_subscription(payload).await;
        }
        if !CREDIT_BEARING_EVENTS.contains(&event_type) {
            tracing::info!(event_type, event_id = ?payload.event_id(), "ignoring webhook event");
            return Ok(WebhookOutcome::Ignored);
        }

        let event = match self.purchase_event(payload) {
            Ok(event) => event,
            Err(GatewayError::InvalidRequest(reason)) => {
                tracing::error!(
                    event_type,
                    event_id = ?payload.event_id(),
                    %reason,
                    "credit-bearing webhook rejected, nothing credited"
                );
                return Ok(WebhookOutcome::Rejected { reason });
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            event_id = %event.id,
            event_type,
            plan_id = %event.plan_id,
            billing_period = %event.billing_period,
            amount = event.amount,
            "purchase notification received"
        );

        Ok(match self.ledger.apply_purchase(&event).await? {
            CreditOutcome::Applied {
                account_id,
                new_balance,
            } => WebhookOutcome::Credited {
                account_id,
                amount: event.amount,
                new_balance,
            },
            CreditOutcome::Pending => WebhookOutcome::Pending,
            CreditOutcome::AlreadyApplied => WebhookOutcome::Duplicate,
        })
    }

    async fn cancel_subscription(
        &self,
        payload: &WebhookPayload,
    ) -> Result<WebhookOutcome, GatewayError> {
        match self.ledger.cancel_subscription(&payload.buyer()).await? {
            Some(account_id) => Ok(WebhookOutcome::Canceled { account_id }),
            None => {
                tracing::warn!(
                    event_id = ?payload.event_id(),
                    "subscription cancellation names no known account"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Creates a checkout session for `plan_id`. Without a billing period
    /// the plan's purchasable offer is used.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidRequest`] for unknown or non-purchasable
    /// plans, or [`GatewayError::PaymentProvider`] if the processor fails.
    pub async fn start_checkout(
        &self,
        identity: &Identity,
        plan_id: &str,
        period: Option<BillingPeriod>,
    ) -> Result<CheckoutSession, GatewayError> {
        let offer = match period {
            Some(period) => self.pricing.offer_for_plan(plan_id, period),
            None => self
                .pricing
                .offers
                .iter()
                .find(|o| o.plan_id == plan_id && o.product_id.is_some()),
        }
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown plan: {plan_id}")))?;

        let product_id = offer.product_id.clone().ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "plan {plan_id} is not purchasable {}",
                offer.billing_period
            ))
        })?;

        let request = CheckoutSessionRequest {
            product_id,
            account_id: identity.account_id.to_string(),
            email: identity.email.clone(),
            plan_id: offer.plan_id.clone(),
            billing_period: offer.billing_period.to_string(),
            request_id: Uuid::new_v4().to_string(),
        };
        let session = self.gateway.create_checkout(&request).await?;
        tracing::info!(
            account_id = %identity.account_id,
            plan_id = %request.plan_id,
            session_id = %session.session_id,
            "checkout session created"
        );
        Ok(session)
    }

    /// Looks up a checkout session. Never grants credits; only the webhook
    /// does.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidRequest`] for a malformed id, or
    /// [`GatewayError::PaymentProvider`] if the lookup fails.
    pub async fn verify_checkout(&self, session_id: &str) -> Result<CheckoutStatus, GatewayError> {
        self.gateway.checkout_status(session_id).await
    }
}
