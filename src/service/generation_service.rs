//! Generation proxy: gate, upstream call, settle.
//!
//! Every request walks `Authenticated -> Gated -> Upstreamed -> Settled`.
//! Authentication happens in the HTTP extractor; this service starts from a
//! resolved [`Identity`]. Credits are only debited after the upstream
//! returned a usable image, and always by the cost fixed before the call.

use std::sync::Arc;

use uuid::Uuid;

use super::LedgerService;
use crate::domain::{GenerationMode, GenerationParams, GenerationPolicy, GenerationRequest, Identity};
use crate::error::GatewayError;
use crate::persistence::NewDiscrepancy;
use crate::upstream::ImageGenerator;

/// A settled generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Correlation id for logs and discrepancy records.
    pub request_id: Uuid,
    /// Generated image URL.
    pub image_url: String,
    /// Model that produced it.
    pub model: String,
    /// Aspect ratio forwarded upstream.
    pub aspect_ratio: String,
    /// Generation mode.
    pub mode: GenerationMode,
    /// Credits charged (the fixed cost, even if the debit failed).
    pub credits_charged: i64,
    /// Balance after settlement.
    pub remaining_credits: i64,
    /// Set when the image was returned but the debit could not be applied.
    pub billing_discrepancy: bool,
}

/// Orchestrates metered generation requests.
#[derive(Debug, Clone)]
pub struct GenerationService {
    ledger: Arc<LedgerService>,
    generator: Arc<dyn ImageGenerator>,
    policy: GenerationPolicy,
}

impl GenerationService {
    /// Creates a generation service.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerService>,
        generator: Arc<dyn ImageGenerator>,
        policy: GenerationPolicy,
    ) -> Self {
        Self {
            ledger,
            generator,
            policy,
        }
    }

    /// Returns the active generation policy.
    #[must_use]
    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }

    /// Runs one metered generation for `identity`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InvalidRequest`] for malformed parameters.
    /// - [`GatewayError::InsufficientCredits`] when the gate refuses; the
    ///   upstream is never called.
    /// - [`GatewayError::Upstream`] when generation fails; nothing is
    ///   debited.
    /// - A persistence error if the gate cannot read the balance.
    pub async fn generate(
        &self,
        identity: &Identity,
        params: GenerationParams,
    ) -> Result<GenerationOutcome, GatewayError> {
        let request = GenerationRequest::new(identity.account_id.clone(), params, &self.policy)?;
        let request_id = Uuid::new_v4();
        let account_id = &request.account_id;

        let gate = self
            .ledger
            .check_entitlement(account_id, request.cost)
            .await?;
        if !gate.allowed {
            tracing::info!(
                %request_id,
                %account_id,
                cost = request.cost,
                balance = gate.current_balance,
                "generation refused by entitlement gate"
            );
            return Err(GatewayError::InsufficientCredits {
                required: request.cost,
                available: gate.current_balance,
            });
        }

        tracing::info!(
            %request_id,
            %account_id,
            mode = %request.mode,
            model = %request.model,
            aspect_ratio = %request.aspect_ratio,
            prompt_chars = request.prompt.chars().count(),
            "calling upstream generator"
        );
        let image = self.generator.generate(&request).await.map_err(|failure| {
            tracing::warn!(
                %request_id,
                %account_id,
                kind = %failure.kind,
                status = ?failure.status,
                retryable = failure.is_retryable(),
                "upstream generation failed, nothing debited"
            );
            GatewayError::Upstream(failure)
        })?;

        let (remaining_credits, billing_discrepancy) =
            match self.ledger.debit(account_id, request.cost).await {
                Ok(balance) => (balance, false),
                Err(err) => (self.settle_discrepancy(&request, request_id, &err).await, true),
            };

        Ok(GenerationOutcome {
            request_id,
            image_url: image.image_url,
            model: image.model,
            aspect_ratio: request.aspect_ratio,
            mode: request.mode,
            credits_charged: request.cost,
            remaining_credits,
            billing_discrepancy,
        })
    }

    /// The image is already produced; log and persist the missed debit and
    /// return the balance observed now.
    async fn settle_discrepancy(
        &self,
        request: &GenerationRequest,
        request_id: Uuid,
        err: &GatewayError,
    ) -> i64 {
        let observed_balance = match err {
            GatewayError::InsufficientCredits { available, .. } => *available,
            _ => self
                .ledger
                .check_entitlement(&request.account_id, request.cost)
                .await
                .map_or(0, |g| g.current_balance),
        };

        tracing::error!(
            %request_id,
            account_id = %request.account_id,
            cost = request.cost,
            observed_balance,
            error = %err,
            "debit failed after successful generation, billing discrepancy"
        );

        let record = NewDiscrepancy {
            account_id: request.account_id.clone(),
            request_id,
            cost: request.cost,
            observed_balance,
            model: request.model.clone(),
        };
        if let Err(e) = self.ledger.record_discrepancy(&record).await {
            tracing::error!(%request_id, error = %e, "failed to persist billing discrepancy");
        }
        observed_balance
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::{Account, AccountId, PurchaseEvent, PurchaseEventId};
    use crate::persistence::{
        BillingDiscrepancy, CreditOutcome, LedgerError, LedgerStore, Provisioned,
    };
    use crate::persistence::memory::MemoryLedger;
    use crate::upstream::{GeneratedImage, UpstreamErrorKind, UpstreamFailure};

    #[derive(Debug, Default)]
    struct FakeGenerator {
        calls: AtomicUsize,
        fail_with: Option<UpstreamErrorKind>,
    }

    #[async_trait]
    impl ImageGenerator for FakeGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GeneratedImage, UpstreamFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(kind) => Err(UpstreamFailure::new(kind, None, "boom")),
                None => Ok(GeneratedImage {
                    image_url: "https://cdn.example/img.png".to_string(),
                    model: request.model.clone(),
                }),
            }
        }
    }

    /// Reports whatever balance it was seeded with, but refuses every debit
    /// as if a concurrent request had drained the account in between.
    #[derive(Debug)]
    struct RacingStore {
        inner: MemoryLedger,
    }

    #[async_trait]
    impl LedgerStore for RacingStore {
        async fn ensure_account(
            &self,
            identity: &Identity,
            opening_balance: i64,
        ) -> Result<Provisioned, LedgerError> {
            self.inner.ensure_account(identity, opening_balance).await
        }
        async fn find_account(
            &self,
            id: &AccountId,
        ) -> Result<Option<Account>, LedgerError> {
            self.inner.find_account(id).await
        }
        async fn find_account_by_email(
            &self,
            email: &str,
        ) -> Result<Option<Account>, LedgerError> {
            self.inner.find_account_by_email(email).await
        }
        async fn get_balance(&self, id: &AccountId) -> Result<i64, LedgerError> {
            self.inner.get_balance(id).await
        }
        async fn adjust_balance(
            &self,
            id: &AccountId,
            delta: i64,
            expected_prior: Option<i64>,
        ) -> Result<i64, LedgerError> {
            self.inner.adjust_balance(id, delta, expected_prior).await
        }
        async fn debit(&self, _id: &AccountId, cost: i64) -> Result<i64, LedgerError> {
            Err(LedgerError::InsufficientCredits {
                required: cost,
                available: 0,
            })
        }
        async fn claim(
            &self,
            event: &PurchaseEvent,
        ) -> Result<bool, LedgerError> {
            self.inner.claim(event).await
        }
        async fn claim_and_credit(
            &self,
            event: &PurchaseEvent,
            account_id: &AccountId,
        ) -> Result<CreditOutcome, LedgerError> {
            self.inner.claim_and_credit(event, account_id).await
        }
        async fn set_tier(&self, id: &AccountId, tier: &str) -> Result<(), LedgerError> {
            self.inner.set_tier(id, tier).await
        }
        async fn find_purchase_event(
            &self,
            id: &PurchaseEventId,
        ) -> Result<Option<PurchaseEvent>, LedgerError> {
            self.inner.find_purchase_event(id).await
        }
        async fn list_unapplied_events(
            &self,
        ) -> Result<Vec<PurchaseEvent>, LedgerError> {
            self.inner.list_unapplied_events().await
        }
        async fn list_unapplied_events_for(
            &self,
            account_id: &AccountId,
            email: Option<&str>,
        ) -> Result<Vec<PurchaseEvent>, LedgerError> {
            self.inner.list_unapplied_events_for(account_id, email).await
        }
        async fn apply_pending_event(
            &self,
            id: &PurchaseEventId,
            account_id: &AccountId,
        ) -> Result<CreditOutcome, LedgerError> {
            self.inner.apply_pending_event(id, account_id).await
        }
        async fn record_discrepancy(
            &self,
            discrepancy: &NewDiscrepancy,
        ) -> Result<(), LedgerError> {
            self.inner.record_discrepancy(discrepancy).await
        }
        async fn list_discrepancies(
            &self,
        ) -> Result<Vec<BillingDiscrepancy>, LedgerError>
        {
            self.inner.list_discrepancies().await
        }
    }

    fn policy() -> GenerationPolicy {
        GenerationPolicy {
            cost: 2,
            default_model: "google/gemini-2.5-flash-image".to_string(),
            allowed_models: vec!["google/gemini-2.5-flash-image".to_string()],
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            prompt: "a lighthouse at dusk".to_string(),
            mode: GenerationMode::TextToImage,
            image_url: None,
            aspect_ratio: Some("16:9".to_string()),
            model: None,
        }
    }

    async fn setup(
        store: Arc<dyn LedgerStore>,
        balance: i64,
        generator: Arc<FakeGenerator>,
    ) -> (GenerationService, Arc<LedgerService>, Identity) {
        let ledger = Arc::new(LedgerService::new(store, balance));
        let identity = Identity::new(AccountId::new("u1"), Some("u1@example.com".to_string()));
        let Ok(_) = ledger.ensure_account(&identity).await else {
            panic!("provision");
        };
        let dyn_generator: Arc<dyn ImageGenerator> = generator;
        let svc = GenerationService::new(Arc::clone(&ledger), dyn_generator, policy());
        (svc, ledger, identity)
    }

    #[tokio::test]
    async fn gate_blocks_upstream_call() {
        let generator = Arc::new(FakeGenerator::default());
        let (svc, ledger, who) =
            setup(Arc::new(MemoryLedger::new()), 1, Arc::clone(&generator)).await;

        let result = svc.generate(&who, params()).await;
        assert!(matches!(
            result,
            Err(GatewayError::InsufficientCredits {
                required: 2,
                available: 1
            })
        ));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        let Ok(account) = ledger.account(&who.account_id).await else {
            panic!("account");
        };
        assert_eq!(account.credits, 1);
    }

    #[tokio::test]
    async fn success_debits_fixed_cost() {
        let generator = Arc::new(FakeGenerator::default());
        let (svc, _, who) = setup(Arc::new(MemoryLedger::new()), 10, Arc::clone(&generator)).await;

        let Ok(outcome) = svc.generate(&who, params()).await else {
            panic!("generation");
        };
        assert_eq!(outcome.remaining_credits, 8);
        assert_eq!(outcome.credits_charged, 2);
        assert_eq!(outcome.aspect_ratio, "16:9");
        assert!(!outcome.billing_discrepancy);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upstream_failure_debits_nothing() {
        let generator = Arc::new(FakeGenerator {
            calls: AtomicUsize::new(0),
            fail_with: Some(UpstreamErrorKind::Timeout),
        });
        let (svc, ledger, who) =
            setup(Arc::new(MemoryLedger::new()), 10, Arc::clone(&generator)).await;

        let Err(GatewayError::Upstream(failure)) = svc.generate(&who, params()).await else {
            panic!("expected upstream error");
        };
        assert!(failure.is_retryable());
        let Ok(account) = ledger.account(&who.account_id).await else {
            panic!("account");
        };
        assert_eq!(account.credits, 10);
    }

    #[tokio::test]
    async fn lost_debit_race_returns_image_and_records_discrepancy() {
        let generator = Arc::new(FakeGenerator::default());
        let store = Arc::new(RacingStore {
            inner: MemoryLedger::new(),
        });
        let dyn_store: Arc<dyn LedgerStore> = Arc::<RacingStore>::clone(&store);
        let (svc, _, who) = setup(dyn_store, 10, Arc::clone(&generator)).await;

        let Ok(outcome) = svc.generate(&who, params()).await else {
            panic!("image should still be returned");
        };
        assert!(outcome.billing_discrepancy);
        assert_eq!(outcome.image_url, "https://cdn.example/img.png");

        let Ok(recorded) = store.list_discrepancies().await else {
            panic!("list");
        };
        assert_eq!(recorded.len(), 1);
        assert!(recorded.iter().all(|d| d.request_id == outcome.request_id && d.cost == 2));
    }
}
