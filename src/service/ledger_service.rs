//! Ledger service: entitlement gate plus debit and credit operators.
//!
//! All balance changes go through [`LedgerStore`] atomics. This layer only
//! adds the retry-once policy for optimistic conflicts, purchase target
//! resolution, and settling parked purchases. A parked purchase is applied
//! when its buyer first signs in, when the processor re-delivers it, or by
//! the reconciliation pass.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::account::DEFAULT_TIER;
use crate::domain::{Account, AccountId, Identity, PurchaseEvent, PurchaseStatus, PurchaseTarget};
use crate::error::GatewayError;
use crate::persistence::{
    BillingDiscrepancy, CreditOutcome, LedgerError, LedgerStore, NewDiscrepancy, Provisioned,
};

/// Result of an entitlement check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    /// Whether the balance covers the requested cost.
    pub allowed: bool,
    /// Balance at the time of the check.
    pub current_balance: i64,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Purchase events applied by this pass.
    pub applied: Vec<String>,
    /// Purchase events still waiting for their account.
    pub pending: Vec<String>,
    /// Recorded billing discrepancies, newest first.
    pub discrepancies: Vec<BillingDiscrepancy>,
}

/// Runs `op`, retrying exactly once if the store reports a conflicting
/// writer.
async fn retry_once<T, F, Fut>(op: &'static str, f: F) -> Result<T, LedgerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    match f().await {
        Err(LedgerError::ConcurrentModification) => {
            tracing::warn!(op, "concurrent modification, retrying once");
            f().await
        }
        other => other,
    }
}

/// Credits ledger operations.
#[derive(Debug, Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    signup_bonus: i64,
}

impl LedgerService {
    /// Creates a ledger service. New accounts open with `signup_bonus`
    /// credits.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, signup_bonus: i64) -> Self {
        Self {
            store,
            signup_bonus: signup_bonus.max(0),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Provisions the account for a freshly authenticated identity.
    ///
    /// On creation, purchases parked for this buyer are applied. Failing to
    /// apply them is logged and left to reconciliation; sign-in still
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    pub async fn ensure_account(&self, identity: &Identity) -> Result<Account, GatewayError> {
        let Provisioned { account, created } = self
            .store
            .ensure_account(identity, self.signup_bonus)
            .await?;
        if !created {
            return Ok(account);
        }

        tracing::info!(account_id = %account.id, credits = account.credits, "account provisioned");
        if identity.email.is_some() && account.email.is_none() {
            tracing::warn!(
                account_id = %account.id,
                "email already belongs to another account, stored without one"
            );
        }

        let parked = match self
            .store
            .list_unapplied_events_for(&account.id, account.email.as_deref())
            .await
        {
            Ok(parked) => parked,
            Err(e) => {
                tracing::error!(account_id = %account.id, error = %e, "failed to list parked purchases");
                return Ok(account);
            }
        };

        let mut settled = false;
        for event in parked {
            match self.settle(&event).await {
                Ok(Some(CreditOutcome::Applied { .. })) => settled = true,
                Ok(_) => {}
                Err(e) => tracing::error!(
                    account_id = %account.id,
                    event_id = %event.id,
                    error = %e,
                    "failed to apply parked purchase"
                ),
            }
        }
        if settled {
            self.account(&account.id).await
        } else {
            Ok(account)
        }
    }

    /// Returns an account by id.
    ///
    /// # Errors
    ///
    /// [`GatewayError::AccountNotFound`] or [`GatewayError::PersistenceError`].
    pub async fn account(&self, id: &AccountId) -> Result<Account, GatewayError> {
        self.store
            .find_account(id)
            .await?
            .ok_or_else(|| GatewayError::AccountNotFound(id.to_string()))
    }

    /// Entitlement gate: a pure read of the balance against `required`.
    ///
    /// Advisory only; [`Self::debit`] re-validates atomically.
    ///
    /// # Errors
    ///
    /// [`GatewayError::AccountNotFound`] or [`GatewayError::PersistenceError`].
    pub async fn check_entitlement(
        &self,
        id: &AccountId,
        required: i64,
    ) -> Result<Entitlement, GatewayError> {
        let current_balance = self.store.get_balance(id).await?;
        Ok(Entitlement {
            allowed: current_balance >= required,
            current_balance,
        })
    }

    /// Debit operator: atomically removes `cost` credits if the balance
    /// still covers it. Returns the new balance.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InsufficientCredits`] when the balance no longer
    /// covers `cost`, [`GatewayError::ConcurrentModification`] if the
    /// retry also conflicts, or a persistence error.
    pub async fn debit(&self, id: &AccountId, cost: i64) -> Result<i64, GatewayError> {
        let new_balance = retry_once("debit", || self.store.debit(id, cost)).await?;
        tracing::info!(account_id = %id, cost, new_balance, "credits debited");
        Ok(new_balance)
    }

    /// Credit operator: claims `event` and credits its amount to
    /// `account_id` as one unit. A replayed event is a no-op
    /// [`CreditOutcome::AlreadyApplied`].
    ///
    /// # Errors
    ///
    /// [`GatewayError::AccountNotFound`], [`GatewayError::ConcurrentModification`]
    /// if the retry also conflicts, or a persistence error.
    pub async fn credit(
        &self,
        account_id: &AccountId,
        event: &PurchaseEvent,
    ) -> Result<CreditOutcome, GatewayError> {
        let outcome = retry_once("credit", || self.store.claim_and_credit(event, account_id)).await?;
        match &outcome {
            CreditOutcome::Applied {
                account_id,
                new_balance,
            } => tracing::info!(
                %account_id,
                event_id = %event.id,
                amount = event.amount,
                new_balance,
                "purchase credited"
            ),
            CreditOutcome::AlreadyApplied => {
                tracing::info!(event_id = %event.id, "purchase event already applied");
            }
            CreditOutcome::Pending => {}
        }
        Ok(outcome)
    }

    /// Resolves the account a purchase event targets and credits it. If no
    /// account matches yet the event is claimed as unapplied. A re-delivery
    /// of a parked event applies it once the buyer's account exists.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the claim could not be stored.
    pub async fn apply_purchase(&self, event: &PurchaseEvent) -> Result<CreditOutcome, GatewayError> {
        match self.resolve_target(&event.target).await? {
            Some(account_id) => match self.credit(&account_id, event).await {
                Ok(CreditOutcome::AlreadyApplied) => self.redeliver(event, &account_id).await,
                Err(GatewayError::AccountNotFound(_)) => self.park(event).await,
                other => other,
            },
            None => self.park(event).await,
        }
    }

    /// The event id was already claimed. If that claim parked it, the
    /// account now exists and gets the stored amount.
    async fn redeliver(
        &self,
        event: &PurchaseEvent,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, GatewayError> {
        let parked = self
            .store
            .find_purchase_event(&event.id)
            .await?
            .is_some_and(|stored| stored.status == PurchaseStatus::Unapplied);
        if !parked {
            return Ok(CreditOutcome::AlreadyApplied);
        }
        let outcome = retry_once("apply parked", || {
            self.store.apply_pending_event(&event.id, account_id)
        })
        .await?;
        if let CreditOutcome::Applied { new_balance, .. } = &outcome {
            tracing::info!(
                %account_id,
                event_id = %event.id,
                new_balance,
                "parked purchase applied on re-delivery"
            );
        }
        Ok(outcome)
    }

    async fn park(&self, event: &PurchaseEvent) -> Result<CreditOutcome, GatewayError> {
        if self.store.claim(event).await? {
            // The buyer may have signed up between resolution and the claim.
            if let Some(outcome @ CreditOutcome::Applied { .. }) = self.settle(event).await? {
                return Ok(outcome);
            }
            tracing::warn!(
                event_id = %event.id,
                amount = event.amount,
                "no account for purchase event yet, stored as unapplied"
            );
            Ok(CreditOutcome::Pending)
        } else {
            tracing::info!(event_id = %event.id, "purchase event already claimed");
            Ok(CreditOutcome::AlreadyApplied)
        }
    }

    /// Applies an unapplied event to the account its buyer resolves to now.
    /// `None` while no account matches.
    async fn settle(&self, event: &PurchaseEvent) -> Result<Option<CreditOutcome>, LedgerError> {
        let Some(account_id) = self.resolve_target(&event.target).await? else {
            return Ok(None);
        };
        match retry_once("apply parked", || {
            self.store.apply_pending_event(&event.id, &account_id)
        })
        .await
        {
            Ok(outcome) => {
                if let CreditOutcome::Applied { new_balance, .. } = &outcome {
                    tracing::info!(
                        %account_id,
                        event_id = %event.id,
                        amount = event.amount,
                        new_balance,
                        "parked purchase applied"
                    );
                }
                Ok(Some(outcome))
            }
            Err(LedgerError::AccountNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Account id first, email second.
    async fn resolve_target(
        &self,
        target: &PurchaseTarget,
    ) -> Result<Option<AccountId>, LedgerError> {
        if let Some(id) = &target.account_id
            && self.store.find_account(id).await?.is_some()
        {
            return Ok(Some(id.clone()));
        }
        if let Some(email) = &target.email
            && let Some(account) = self.store.find_account_by_email(email).await?
        {
            return Ok(Some(account.id));
        }
        Ok(None)
    }

    /// Admin adjustment. With `expected_balance` this is a compare-and-swap
    /// and a stale expectation surfaces as a conflict instead of being
    /// retried.
    ///
    /// # Errors
    ///
    /// [`GatewayError::AccountNotFound`], [`GatewayError::ConcurrentModification`],
    /// [`GatewayError::InsufficientCredits`] if the result would be
    /// negative, or [`GatewayError::InvalidRequest`] for a zero delta.
    pub async fn adjust(
        &self,
        id: &AccountId,
        delta: i64,
        expected_balance: Option<i64>,
    ) -> Result<i64, GatewayError> {
        if delta == 0 {
            return Err(GatewayError::InvalidRequest(
                "delta must be non-zero".to_string(),
            ));
        }
        let new_balance = self.store.adjust_balance(id, delta, expected_balance).await?;
        tracing::info!(account_id = %id, delta, new_balance, "balance adjusted by operator");
        Ok(new_balance)
    }

    /// Resets the plan tier of the account a subscription cancellation
    /// names. Credits already granted stay. Returns `None` when no account
    /// matches.
    ///
    /// # Errors
    ///
    /// Returns a persistence error on storage failure.
    pub async fn cancel_subscription(
        &self,
        target: &PurchaseTarget,
    ) -> Result<Option<AccountId>, GatewayError> {
        let Some(account_id) = self.resolve_target(target).await? else {
            return Ok(None);
        };
        match self.store.set_tier(&account_id, DEFAULT_TIER).await {
            Ok(()) => {
                tracing::info!(%account_id, tier = DEFAULT_TIER, "subscription canceled, tier reset");
                Ok(Some(account_id))
            }
            Err(LedgerError::AccountNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists a billing discrepancy.
    ///
    /// # Errors
    ///
    /// Returns a persistence error on storage failure.
    pub async fn record_discrepancy(&self, discrepancy: &NewDiscrepancy) -> Result<(), GatewayError> {
        Ok(self.store.record_discrepancy(discrepancy).await?)
    }

    /// Applies every unapplied purchase event whose account now exists and
    /// reports what is still outstanding.
    ///
    /// # Errors
    ///
    /// Returns a persistence error on storage failure.
    pub async fn reconcile(&self) -> Result<ReconcileReport, GatewayError> {
        let mut applied = Vec::new();
        let mut pending = Vec::new();

        for event in self.store.list_unapplied_events().await? {
            match self.settle(&event).await? {
                Some(CreditOutcome::Applied { .. }) => applied.push(event.id.to_string()),
                Some(_) => {}
                None => pending.push(event.id.to_string()),
            }
        }

        let discrepancies = self.store.list_discrepancies().await?;
        Ok(ReconcileReport {
            applied,
            pending,
            discrepancies,
        })
    }
}
