//! Persistence layer: the credits ledger store.
//!
//! [`LedgerStore`] is the storage contract every ledger operation goes
//! through. Implementations must make each method atomic on its own:
//! balances change only through single conditional updates (or a
//! compare-and-swap against a caller-supplied prior balance), and a
//! purchase event is claimed through a uniqueness constraint before any
//! credit is applied.
//!
//! Two backends exist: [`postgres::PostgresLedger`] for production and
//! [`memory::MemoryLedger`] for tests and local development.

pub mod memory;
pub mod models;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;

use crate::domain::{Account, AccountId, Identity, PurchaseEvent, PurchaseEventId};
pub use models::{BillingDiscrepancy, NewDiscrepancy};

/// Ledger-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// No account with the given id.
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// The mutation would drive the balance below zero.
    #[error("insufficient credits: requires {required}, balance is {available}")]
    InsufficientCredits {
        /// Credits the mutation needed.
        required: i64,
        /// Balance observed when the mutation was refused.
        available: i64,
    },

    /// An optimistic precondition no longer holds, or the database aborted
    /// the transaction because of a conflicting writer.
    #[error("concurrent modification")]
    ConcurrentModification,

    /// A debit or credit amount that is not positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// Any other storage failure.
    #[error("database error: {0}")]
    Database(String),
}

/// Result of crediting a purchase event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    /// The event was claimed now and its amount credited.
    Applied {
        /// Account that received the credit.
        account_id: AccountId,
        /// Balance after the credit.
        new_balance: i64,
    },
    /// The event was claimed now but no account could be resolved; it stays
    /// `unapplied` until a reconciliation pass finds its account.
    Pending,
    /// The event id had already been claimed. Nothing changed.
    AlreadyApplied,
}

/// Result of [`LedgerStore::ensure_account`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// The stored account.
    pub account: Account,
    /// Whether this call created it.
    pub created: bool,
}

/// Durable storage for accounts, purchase events, and billing
/// discrepancies.
#[async_trait]
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Creates the account for `identity` if it does not exist yet and
    /// returns the stored record. Existing balances are never touched.
    ///
    /// Emails are unique across accounts. If the identity's email already
    /// belongs to another account, the account is stored without one.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn ensure_account(
        &self,
        identity: &Identity,
        opening_balance: i64,
    ) -> Result<Provisioned, LedgerError>;

    /// Looks up an account by id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn find_account(&self, id: &AccountId) -> Result<Option<Account>, LedgerError>;

    /// Looks up an account by (normalized) email.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, LedgerError>;

    /// Returns the current balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`] for unknown accounts.
    async fn get_balance(&self, id: &AccountId) -> Result<i64, LedgerError>;

    /// Atomically adds `delta` (which may be negative) to the balance.
    ///
    /// When `expected_prior` is given the update only happens if the
    /// balance still equals it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountNotFound`], [`LedgerError::ConcurrentModification`]
    /// when `expected_prior` is stale, or [`LedgerError::InsufficientCredits`]
    /// when the result would be negative.
    async fn adjust_balance(
        &self,
        id: &AccountId,
        delta: i64,
        expected_prior: Option<i64>,
    ) -> Result<i64, LedgerError>;

    /// Atomically decrements the balance by `cost` only if the balance is
    /// at least `cost`. Returns the new balance.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientCredits`] when the balance is too low,
    /// [`LedgerError::AccountNotFound`], or [`LedgerError::InvalidAmount`]
    /// for a non-positive cost.
    async fn debit(&self, id: &AccountId, cost: i64) -> Result<i64, LedgerError>;

    /// Records `event` as `unapplied` if its id has never been seen.
    /// Returns `true` exactly once per id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn claim(&self, event: &PurchaseEvent) -> Result<bool, LedgerError>;

    /// Claims `event` and, only if the claim succeeds, credits its amount to
    /// `account_id` and marks it applied, as one unit.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountNotFound`] (nothing is recorded in that case),
    /// [`LedgerError::InvalidAmount`], or [`LedgerError::Database`].
    async fn claim_and_credit(
        &self,
        event: &PurchaseEvent,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, LedgerError>;

    /// Sets the account's plan tier.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountNotFound`] or [`LedgerError::Database`].
    async fn set_tier(&self, id: &AccountId, tier: &str) -> Result<(), LedgerError>;

    /// Returns a stored purchase event.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn find_purchase_event(
        &self,
        id: &PurchaseEventId,
    ) -> Result<Option<PurchaseEvent>, LedgerError>;

    /// Returns all claimed-but-unapplied purchase events, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn list_unapplied_events(&self) -> Result<Vec<PurchaseEvent>, LedgerError>;

    /// Returns the unapplied purchase events that name `account_id` or
    /// `email` as their buyer, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn list_unapplied_events_for(
        &self,
        account_id: &AccountId,
        email: Option<&str>,
    ) -> Result<Vec<PurchaseEvent>, LedgerError>;

    /// Applies a previously claimed, still unapplied event to `account_id`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountNotFound`] or [`LedgerError::Database`].
    async fn apply_pending_event(
        &self,
        id: &PurchaseEventId,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, LedgerError>;

    /// Persists a billing discrepancy for operator follow-up.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn record_discrepancy(&self, discrepancy: &NewDiscrepancy) -> Result<(), LedgerError>;

    /// Returns recorded billing discrepancies, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage failure.
    async fn list_discrepancies(&self) -> Result<Vec<BillingDiscrepancy>, LedgerError>;
}
