//! In-process ledger store.
//!
//! [`MemoryLedger`] keeps accounts, purchase events, and discrepancies
//! behind one [`tokio::sync::Mutex`], which makes every trait method atomic
//! within a single process. It is not durable and must not back more than
//! one instance; it exists for tests and for running the gateway locally
//! without PostgreSQL.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{BillingDiscrepancy, NewDiscrepancy};
use super::{CreditOutcome, LedgerError, LedgerStore, Provisioned};
use crate::domain::account::normalize_email;
use crate::domain::{Account, AccountId, Identity, PurchaseEvent, PurchaseEventId, PurchaseStatus};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    events: HashMap<PurchaseEventId, PurchaseEvent>,
    discrepancies: Vec<BillingDiscrepancy>,
}

impl LedgerState {
    fn account_mut(&mut self, id: &AccountId) -> Result<&mut Account, LedgerError> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    /// Unapplied events matching `keep`, oldest first.
    fn unapplied(&self, keep: impl Fn(&PurchaseEvent) -> bool) -> Vec<PurchaseEvent> {
        let mut pending: Vec<PurchaseEvent> = self
            .events
            .values()
            .filter(|e| e.status == PurchaseStatus::Unapplied && keep(e))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.received_at);
        pending
    }

    fn apply(
        &mut self,
        event_id: &PurchaseEventId,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, LedgerError> {
        let (amount, plan_id) = match self.events.get(event_id) {
            Some(e) if e.status == PurchaseStatus::Unapplied => (e.amount, e.plan_id.clone()),
            _ => return Ok(CreditOutcome::AlreadyApplied),
        };

        let account = self.account_mut(account_id)?;
        account.credits = account
            .credits
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount(amount))?;
        account.tier = plan_id;
        account.updated_at = Utc::now();
        let new_balance = account.credits;

        if let Some(event) = self.events.get_mut(event_id) {
            event.status = PurchaseStatus::Applied;
            event.account_id = Some(account_id.clone());
            event.applied_at = Some(Utc::now());
        }
        Ok(CreditOutcome::Applied {
            account_id: account_id.clone(),
            new_balance,
        })
    }
}

/// Mutex-guarded, non-durable [`LedgerStore`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an account record. Test and seeding helper.
    pub async fn insert_account(&self, account: Account) {
        let mut state = self.state.lock().await;
        state.accounts.insert(account.id.clone(), account);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn ensure_account(
        &self,
        identity: &Identity,
        opening_balance: i64,
    ) -> Result<Provisioned, LedgerError> {
        let mut state = self.state.lock().await;
        let id = &identity.account_id;
        let email = identity
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|wanted| {
                !state
                    .accounts
                    .values()
                    .any(|a| a.id != *id && a.email.as_deref() == Some(wanted.as_str()))
            });
        let created = !state.accounts.contains_key(id);
        let account = state
            .accounts
            .entry(id.clone())
            .or_insert_with(|| Account::new(id.clone(), email.clone(), opening_balance.max(0)));
        if account.email.is_none() {
            account.email = email;
        }
        Ok(Provisioned {
            account: account.clone(),
            created,
        })
    }

    async fn find_account(&self, id: &AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.state.lock().await.accounts.get(id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, LedgerError> {
        let wanted = normalize_email(email);
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|a| a.email.as_deref() == Some(wanted.as_str()))
            .cloned())
    }

    async fn get_balance(&self, id: &AccountId) -> Result<i64, LedgerError> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(id)
            .map(|a| a.credits)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    async fn adjust_balance(
        &self,
        id: &AccountId,
        delta: i64,
        expected_prior: Option<i64>,
    ) -> Result<i64, LedgerError> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(id)?;
        if expected_prior.is_some_and(|e| e != account.credits) {
            return Err(LedgerError::ConcurrentModification);
        }
        let next = account
            .credits
            .checked_add(delta)
            .ok_or(LedgerError::InvalidAmount(delta))?;
        if next < 0 {
            return Err(LedgerError::InsufficientCredits {
                required: delta.saturating_neg(),
                available: account.credits,
            });
        }
        account.credits = next;
        account.updated_at = Utc::now();
        Ok(next)
    }

    async fn debit(&self, id: &AccountId, cost: i64) -> Result<i64, LedgerError> {
        if cost <= 0 {
            return Err(LedgerError::InvalidAmount(cost));
        }
        let mut state = self.state.lock().await;
        let account = state.account_mut(id)?;
        if account.credits < cost {
            return Err(LedgerError::InsufficientCredits {
                required: cost,
                available: account.credits,
            });
        }
        account.credits -= cost;
        account.updated_at = Utc::now();
        Ok(account.credits)
    }

    async fn claim(&self, event: &PurchaseEvent) -> Result<bool, LedgerError> {
        if event.amount <= 0 {
            return Err(LedgerError::InvalidAmount(event.amount));
        }
        let mut state = self.state.lock().await;
        if state.events.contains_key(&event.id) {
            return Ok(false);
        }
        state.events.insert(event.id.clone(), event.clone());
        Ok(true)
    }

    async fn claim_and_credit(
        &self,
        event: &PurchaseEvent,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, LedgerError> {
        if event.amount <= 0 {
            return Err(LedgerError::InvalidAmount(event.amount));
        }
        let mut state = self.state.lock().await;
        if state.events.contains_key(&event.id) {
            return Ok(CreditOutcome::AlreadyApplied);
        }
        // Nothing is recorded for an unknown account, matching the
        // transactional rollback of the Postgres backend.
        if !state.accounts.contains_key(account_id) {
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        }
        let mut claimed = event.clone();
        claimed.status = PurchaseStatus::Unapplied;
        state.events.insert(event.id.clone(), claimed);
        state.apply(&event.id, account_id)
    }

    async fn set_tier(&self, id: &AccountId, tier: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(id)?;
        tier.clone_into(&mut account.tier);
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn find_purchase_event(
        &self,
        id: &PurchaseEventId,
    ) -> Result<Option<PurchaseEvent>, LedgerError> {
        Ok(self.state.lock().await.events.get(id).cloned())
    }

    async fn list_unapplied_events(&self) -> Result<Vec<PurchaseEvent>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.unapplied(|_| true))
    }

    async fn list_unapplied_events_for(
        &self,
        account_id: &AccountId,
        email: Option<&str>,
    ) -> Result<Vec<PurchaseEvent>, LedgerError> {
        let email = email.map(normalize_email);
        let state = self.state.lock().await;
        Ok(state.unapplied(|e| {
            e.target.account_id.as_ref() == Some(account_id)
                || (email.is_some() && e.target.email.as_deref().map(normalize_email) == email)
        }))
    }

    async fn apply_pending_event(
        &self,
        id: &PurchaseEventId,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, LedgerError> {
        self.state.lock().await.apply(id, account_id)
    }

    async fn record_discrepancy(&self, discrepancy: &NewDiscrepancy) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.discrepancies.push(BillingDiscrepancy {
            id: Uuid::new_v4(),
            account_id: discrepancy.account_id.clone(),
            request_id: discrepancy.request_id,
            cost: discrepancy.cost,
            observed_balance: discrepancy.observed_balance,
            model: discrepancy.model.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_discrepancies(&self) -> Result<Vec<BillingDiscrepancy>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.discrepancies.iter().rev().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{BillingPeriod, PurchaseTarget};

    fn identity(id: &str) -> Identity {
        Identity::new(AccountId::new(id), Some(format!("{id}@example.com")))
    }

    fn event(id: &str, amount: i64) -> PurchaseEvent {
        PurchaseEvent::received(
            PurchaseEventId::new(id),
            "checkout.completed",
            PurchaseTarget {
                account_id: None,
                email: None,
            },
            "basic",
            BillingPeriod::Monthly,
            amount,
        )
    }

    #[tokio::test]
    async fn ensure_account_is_idempotent() {
        let ledger = MemoryLedger::new();
        let first = ledger.ensure_account(&identity("u1"), 5).await;
        let Ok(first) = first else {
            panic!("account creation failed");
        };
        assert!(first.created);
        assert_eq!(first.account.credits, 5);

        let _ = ledger.debit(&first.account.id, 2).await;
        let Ok(again) = ledger.ensure_account(&identity("u1"), 5).await else {
            panic!("second ensure failed");
        };
        assert!(!again.created);
        assert_eq!(again.account.credits, 3);
    }

    #[tokio::test]
    async fn debit_refuses_overdraft() {
        let ledger = MemoryLedger::new();
        let _ = ledger.ensure_account(&identity("u1"), 1).await;
        let result = ledger.debit(&AccountId::new("u1"), 2).await;
        assert_eq!(
            result,
            Err(LedgerError::InsufficientCredits {
                required: 2,
                available: 1
            })
        );
        assert_eq!(ledger.get_balance(&AccountId::new("u1")).await, Ok(1));
    }

    #[tokio::test]
    async fn adjust_with_stale_expectation_conflicts() {
        let ledger = MemoryLedger::new();
        let _ = ledger.ensure_account(&identity("u1"), 10).await;
        let id = AccountId::new("u1");
        assert_eq!(
            ledger.adjust_balance(&id, 5, Some(9)).await,
            Err(LedgerError::ConcurrentModification)
        );
        assert_eq!(ledger.adjust_balance(&id, 5, Some(10)).await, Ok(15));
        assert!(matches!(
            ledger.adjust_balance(&id, -20, None).await,
            Err(LedgerError::InsufficientCredits { .. })
        ));
    }

    #[tokio::test]
    async fn claim_returns_true_once() {
        let ledger = MemoryLedger::new();
        let evt = event("evt_1", 200);
        assert_eq!(ledger.claim(&evt).await, Ok(true));
        assert_eq!(ledger.claim(&evt).await, Ok(false));
    }

    #[tokio::test]
    async fn claim_and_credit_applies_once() {
        let ledger = MemoryLedger::new();
        let _ = ledger.ensure_account(&identity("u1"), 0).await;
        let id = AccountId::new("u1");
        let evt = event("evt_1", 200);

        let first = ledger.claim_and_credit(&evt, &id).await;
        assert_eq!(
            first,
            Ok(CreditOutcome::Applied {
                account_id: id.clone(),
                new_balance: 200
            })
        );
        let second = ledger.claim_and_credit(&evt, &id).await;
        assert_eq!(second, Ok(CreditOutcome::AlreadyApplied));
        assert_eq!(ledger.get_balance(&id).await, Ok(200));
    }

    #[tokio::test]
    async fn unknown_account_records_nothing() {
        let ledger = MemoryLedger::new();
        let evt = event("evt_1", 200);
        let result = ledger.claim_and_credit(&evt, &AccountId::new("ghost")).await;
        assert!(matches!(result, Err(LedgerError::AccountNotFound(_))));
        assert_eq!(ledger.find_purchase_event(&evt.id).await, Ok(None));
    }

    #[tokio::test]
    async fn pending_event_applies_later() {
        let ledger = MemoryLedger::new();
        let evt = event("evt_1", 200);
        assert_eq!(ledger.claim(&evt).await, Ok(true));
        let Ok(pending) = ledger.list_unapplied_events().await else {
            panic!("listing failed");
        };
        assert_eq!(pending.len(), 1);

        let _ = ledger.ensure_account(&identity("u1"), 0).await;
        let id = AccountId::new("u1");
        let applied = ledger.apply_pending_event(&evt.id, &id).await;
        assert!(matches!(applied, Ok(CreditOutcome::Applied { new_balance: 200, .. })));
        let again = ledger.apply_pending_event(&evt.id, &id).await;
        assert_eq!(again, Ok(CreditOutcome::AlreadyApplied));
        assert_eq!(ledger.get_balance(&id).await, Ok(200));
    }

    #[tokio::test]
    async fn finds_account_by_email_case_insensitively() {
        let ledger = MemoryLedger::new();
        let _ = ledger
            .ensure_account(
                &Identity::new(AccountId::new("u1"), Some("Bob@Example.com".into())),
                0,
            )
            .await;
        let Ok(Some(found)) = ledger.find_account_by_email("bob@example.COM").await else {
            panic!("expected account");
        };
        assert_eq!(found.id, AccountId::new("u1"));
    }

    #[tokio::test]
    async fn email_held_by_another_account_is_not_copied() {
        let ledger = MemoryLedger::new();
        let shared = Some("shared@example.com".to_string());
        let Ok(first) = ledger
            .ensure_account(&Identity::new(AccountId::new("u1"), shared.clone()), 0)
            .await
        else {
            panic!("first account");
        };
        assert_eq!(first.account.email.as_deref(), Some("shared@example.com"));

        let Ok(second) = ledger
            .ensure_account(&Identity::new(AccountId::new("u2"), Some("Shared@Example.com".into())), 0)
            .await
        else {
            panic!("second account");
        };
        assert!(second.created);
        assert_eq!(second.account.email, None);

        let Ok(Some(owner)) = ledger.find_account_by_email("shared@example.com").await else {
            panic!("email lookup");
        };
        assert_eq!(owner.id, AccountId::new("u1"));
    }

    #[tokio::test]
    async fn unapplied_events_are_listed_per_buyer() {
        let ledger = MemoryLedger::new();
        let by_id = PurchaseEvent::received(
            PurchaseEventId::new("evt_id"),
            "checkout.completed",
            PurchaseTarget {
                account_id: Some(AccountId::new("u1")),
                email: None,
            },
            "basic",
            BillingPeriod::Monthly,
            200,
        );
        let by_email = PurchaseEvent::received(
            PurchaseEventId::new("evt_email"),
            "checkout.completed",
            PurchaseTarget {
                account_id: None,
                email: Some(" U1@Example.com".to_string()),
            },
            "basic",
            BillingPeriod::Monthly,
            200,
        );
        for evt in [&by_id, &by_email, &event("evt_other", 200)] {
            assert_eq!(ledger.claim(evt).await, Ok(true));
        }

        let Ok(both) = ledger
            .list_unapplied_events_for(&AccountId::new("u1"), Some("u1@example.com"))
            .await
        else {
            panic!("listing failed");
        };
        let ids: Vec<&str> = both.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"evt_id") && ids.contains(&"evt_email"));

        let Ok(only_id) = ledger.list_unapplied_events_for(&AccountId::new("u1"), None).await else {
            panic!("listing failed");
        };
        assert_eq!(only_id.len(), 1);
    }

    #[tokio::test]
    async fn set_tier_requires_account() {
        let ledger = MemoryLedger::new();
        let _ = ledger.ensure_account(&identity("u1"), 0).await;
        let id = AccountId::new("u1");
        assert_eq!(ledger.set_tier(&id, "pro").await, Ok(()));
        let Ok(Some(account)) = ledger.find_account(&id).await else {
            panic!("account");
        };
        assert_eq!(account.tier, "pro");
        assert!(matches!(
            ledger.set_tier(&AccountId::new("ghost"), "pro").await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }
}
