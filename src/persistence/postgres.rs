//! PostgreSQL implementation of the ledger store.
//!
//! Every balance change is a single `UPDATE … RETURNING` whose `WHERE`
//! clause carries the precondition, so two instances racing on the same
//! account can never lose an update or overdraw it. Purchase events are
//! claimed by inserting into `purchase_events`, whose primary key is the
//! idempotency guard.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::models::{BillingDiscrepancy, NewDiscrepancy};
use super::{CreditOutcome, LedgerError, LedgerStore, Provisioned};
use crate::domain::account::{DEFAULT_TIER, normalize_email};
use crate::domain::{
    Account, AccountId, Identity, PurchaseEvent, PurchaseEventId, PurchaseStatus, PurchaseTarget,
};

/// SQLSTATE codes Postgres uses for serialization failures and deadlocks.
const RETRYABLE_SQLSTATES: [&str; 2] = ["40001", "40P01"];

type AccountRow = (
    String,
    Option<String>,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

type ProvisionedRow = (
    String,
    Option<String>,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    bool,
);

type PurchaseEventRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    i64,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const ACCOUNT_COLUMNS: &str = "id, email, credits, tier, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, event_type, target_account_id, target_email, account_id, \
     plan_id, billing_period, amount, status, received_at, applied_at";

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db
                .code()
                .is_some_and(|code| RETRYABLE_SQLSTATES.iter().any(|s| *s == code))
        {
            return Self::ConcurrentModification;
        }
        Self::Database(err.to_string())
    }
}

/// PostgreSQL-backed ledger using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Creates a ledger over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool with the given limits.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if no connection can be made.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies pending schema migrations from `migrations/`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }

    /// Reads the balance inside `tx` to explain why a conditional update
    /// matched no row.
    async fn balance_in(
        tx: &mut Transaction<'_, Postgres>,
        id: &AccountId,
    ) -> Result<Option<i64>, LedgerError> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT credits FROM accounts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        Ok(balance)
    }

    /// Upserts the account. The email is dropped when another account
    /// already holds it; `xmax = 0` is true only for a freshly inserted row.
    async fn provision(
        &self,
        identity: &Identity,
        opening_balance: i64,
    ) -> Result<Provisioned, sqlx::Error> {
        let email = identity.email.as_deref().map(normalize_email);
        let (id, email, credits, tier, created_at, updated_at, created) =
            sqlx::query_as::<_, ProvisionedRow>(&format!(
                "INSERT INTO accounts (id, email, credits, tier) \
                 VALUES ($1, \
                         CASE WHEN EXISTS (SELECT 1 FROM accounts WHERE email = $2::TEXT AND id <> $1) \
                              THEN NULL ELSE $2::TEXT END, \
                         $3, $4) \
                 ON CONFLICT (id) DO UPDATE SET email = COALESCE(accounts.email, EXCLUDED.email) \
                 RETURNING {ACCOUNT_COLUMNS}, (xmax = 0) AS created"
            ))
            .bind(identity.account_id.as_str())
            .bind(email)
            .bind(opening_balance.max(0))
            .bind(DEFAULT_TIER)
            .fetch_one(&self.pool)
            .await?;
        Ok(Provisioned {
            account: account_from_row((id, email, credits, tier, created_at, updated_at)),
            created,
        })
    }

    async fn balance(&self, id: &AccountId) -> Result<Option<i64>, LedgerError> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT credits FROM accounts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }
}

fn account_from_row(row: AccountRow) -> Account {
    let (id, email, credits, tier, created_at, updated_at) = row;
    Account {
        id: AccountId::new(id),
        email,
        credits,
        tier,
        created_at,
        updated_at,
    }
}

fn event_from_row(row: PurchaseEventRow) -> Result<PurchaseEvent, LedgerError> {
    let (
        id,
        event_type,
        target_account_id,
        target_email,
        account_id,
        plan_id,
        billing_period,
        amount,
        status,
        received_at,
        applied_at,
    ) = row;
    Ok(PurchaseEvent {
        id: PurchaseEventId::new(id),
        event_type,
        target: PurchaseTarget {
            account_id: target_account_id.map(AccountId::new),
            email: target_email,
        },
        account_id: account_id.map(AccountId::new),
        plan_id,
        billing_period: billing_period
            .parse()
            .map_err(|e: crate::domain::pricing::PricingError| LedgerError::Database(e.to_string()))?,
        amount,
        status: status.parse().map_err(LedgerError::Database)?,
        received_at,
        applied_at,
    })
}

/// Inserts the event as `unapplied`. Returns `false` when the id exists.
async fn insert_event<'e, E>(executor: E, event: &PurchaseEvent) -> Result<bool, LedgerError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    if event.amount <= 0 {
        return Err(LedgerError::InvalidAmount(event.amount));
    }
    let result = sqlx::query(
        "INSERT INTO purchase_events \
         (id, event_type, target_account_id, target_email, plan_id, billing_period, amount, status, received_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(event.id.as_str())
    .bind(&event.event_type)
    .bind(event.target.account_id.as_ref().map(AccountId::as_str))
    .bind(event.target.email.as_deref())
    .bind(&event.plan_id)
    .bind(event.billing_period.as_str())
    .bind(event.amount)
    .bind(PurchaseStatus::Unapplied.as_str())
    .bind(event.received_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Credits an account inside `tx` and marks the event applied.
async fn credit_in(
    tx: &mut Transaction<'_, Postgres>,
    event_id: &PurchaseEventId,
    account_id: &AccountId,
    amount: i64,
    tier: &str,
) -> Result<Option<i64>, LedgerError> {
    let new_balance = sqlx::query_scalar::<_, i64>(
        "UPDATE accounts SET credits = credits + $2, tier = $3, updated_at = now() \
         WHERE id = $1 RETURNING credits",
    )
    .bind(account_id.as_str())
    .bind(amount)
    .bind(tier)
    .fetch_optional(&mut **tx)
    .await?;

    if new_balance.is_some() {
        sqlx::query(
            "UPDATE purchase_events SET status = $2, account_id = $3, applied_at = now() \
             WHERE id = $1",
        )
        .bind(event_id.as_str())
        .bind(PurchaseStatus::Applied.as_str())
        .bind(account_id.as_str())
        .execute(&mut **tx)
        .await?;
    }
    Ok(new_balance)
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn ensure_account(
        &self,
        identity: &Identity,
        opening_balance: i64,
    ) -> Result<Provisioned, LedgerError> {
        match self.provision(identity, opening_balance).await {
            // Another account committed the same email between the check
            // and the insert; the second pass sees it and stores no email.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(self.provision(identity, opening_balance).await?)
            }
            other => Ok(other?),
        }
    }

    async fn find_account(&self, id: &AccountId) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(account_from_row))
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = $1"
        ))
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(account_from_row))
    }

    async fn get_balance(&self, id: &AccountId) -> Result<i64, LedgerError> {
        self.balance(id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    async fn adjust_balance(
        &self,
        id: &AccountId,
        delta: i64,
        expected_prior: Option<i64>,
    ) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_scalar::<_, i64>(
            "UPDATE accounts SET credits = credits + $2, updated_at = now() \
             WHERE id = $1 AND credits + $2 >= 0 AND ($3::BIGINT IS NULL OR credits = $3) \
             RETURNING credits",
        )
        .bind(id.as_str())
        .bind(delta)
        .bind(expected_prior)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(balance) = updated {
            tx.commit().await?;
            return Ok(balance);
        }

        let current = Self::balance_in(&mut tx, id).await?;
        tx.rollback().await?;
        match current {
            None => Err(LedgerError::AccountNotFound(id.to_string())),
            Some(balance) if expected_prior.is_some_and(|e| e != balance) => {
                Err(LedgerError::ConcurrentModification)
            }
            Some(balance) => Err(LedgerError::InsufficientCredits {
                required: delta.saturating_neg(),
                available: balance,
            }),
        }
    }

    async fn debit(&self, id: &AccountId, cost: i64) -> Result<i64, LedgerError> {
        if cost <= 0 {
            return Err(LedgerError::InvalidAmount(cost));
        }
        let updated = sqlx::query_scalar::<_, i64>(
            "UPDATE accounts SET credits = credits - $2, updated_at = now() \
             WHERE id = $1 AND credits >= $2 RETURNING credits",
        )
        .bind(id.as_str())
        .bind(cost)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(balance) => Ok(balance),
            None => match self.balance(id).await? {
                None => Err(LedgerError::AccountNotFound(id.to_string())),
                Some(available) => Err(LedgerError::InsufficientCredits {
                    required: cost,
                    available,
                }),
            },
        }
    }

    async fn claim(&self, event: &PurchaseEvent) -> Result<bool, LedgerError> {
        insert_event(&self.pool, event).await
    }

    async fn claim_and_credit(
        &self,
        event: &PurchaseEvent,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // A concurrent insert of the same id blocks on the primary key until
        // the first transaction commits, then matches no row here.
        if !insert_event(&mut *tx, event).await? {
            tx.rollback().await?;
            return Ok(CreditOutcome::AlreadyApplied);
        }

        let Some(new_balance) =
            credit_in(&mut tx, &event.id, account_id, event.amount, &event.plan_id).await?
        else {
            tx.rollback().await?;
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        };

        tx.commit().await?;
        Ok(CreditOutcome::Applied {
            account_id: account_id.clone(),
            new_balance,
        })
    }

    async fn set_tier(&self, id: &AccountId, tier: &str) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE accounts SET tier = $2, updated_at = now() WHERE id = $1")
            .bind(id.as_str())
            .bind(tier)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn find_purchase_event(
        &self,
        id: &PurchaseEventId,
    ) -> Result<Option<PurchaseEvent>, LedgerError> {
        let row = sqlx::query_as::<_, PurchaseEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM purchase_events WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(event_from_row).transpose()
    }

    async fn list_unapplied_events(&self) -> Result<Vec<PurchaseEvent>, LedgerError> {
        let rows = sqlx::query_as::<_, PurchaseEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM purchase_events WHERE status = $1 ORDER BY received_at ASC"
        ))
        .bind(PurchaseStatus::Unapplied.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn list_unapplied_events_for(
        &self,
        account_id: &AccountId,
        email: Option<&str>,
    ) -> Result<Vec<PurchaseEvent>, LedgerError> {
        let rows = sqlx::query_as::<_, PurchaseEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM purchase_events \
             WHERE status = $1 \
               AND (target_account_id = $2 OR ($3::TEXT IS NOT NULL AND lower(btrim(target_email)) = $3)) \
             ORDER BY received_at ASC"
        ))
        .bind(PurchaseStatus::Unapplied.as_str())
        .bind(account_id.as_str())
        .bind(email.map(normalize_email))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn apply_pending_event(
        &self,
        id: &PurchaseEventId,
        account_id: &AccountId,
    ) -> Result<CreditOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Row lock: a second reconciler waits here and then sees `applied`.
        let pending = sqlx::query_as::<_, (i64, String)>(
            "SELECT amount, plan_id FROM purchase_events \
             WHERE id = $1 AND status = $2 FOR UPDATE",
        )
        .bind(id.as_str())
        .bind(PurchaseStatus::Unapplied.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((amount, plan_id)) = pending else {
            tx.rollback().await?;
            return Ok(CreditOutcome::AlreadyApplied);
        };

        let Some(new_balance) = credit_in(&mut tx, id, account_id, amount, &plan_id).await? else {
            tx.rollback().await?;
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        };

        tx.commit().await?;
        Ok(CreditOutcome::Applied {
            account_id: account_id.clone(),
            new_balance,
        })
    }

    async fn record_discrepancy(&self, discrepancy: &NewDiscrepancy) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO billing_discrepancies \
             (id, account_id, request_id, cost, observed_balance, model) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(discrepancy.account_id.as_str())
        .bind(discrepancy.request_id)
        .bind(discrepancy.cost)
        .bind(discrepancy.observed_balance)
        .bind(&discrepancy.model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_discrepancies(&self) -> Result<Vec<BillingDiscrepancy>, LedgerError> {
        let rows = sqlx::query_as::<_, (Uuid, String, Uuid, i64, i64, String, DateTime<Utc>)>(
            "SELECT id, account_id, request_id, cost, observed_balance, model, created_at \
             FROM billing_discrepancies ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, account_id, request_id, cost, observed_balance, model, created_at)| {
                    BillingDiscrepancy {
                        id,
                        account_id: AccountId::new(account_id),
                        request_id,
                        cost,
                        observed_balance,
                        model,
                        created_at,
                    }
                },
            )
            .collect())
    }
}
