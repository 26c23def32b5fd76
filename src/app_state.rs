//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use secrecy::SecretString;

use crate::domain::{GenerationPolicy, PricingTable};
use crate::persistence::LedgerStore;
use crate::service::{AnalysisService, GenerationService, LedgerService, PaymentService};
use crate::upstream::{IdentityProvider, ImageAnalyzer, ImageGenerator, PaymentGateway};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Credits ledger: gate, debit, credit, reconciliation.
    pub ledger: Arc<LedgerService>,
    /// Metered generation proxy.
    pub generation: Arc<GenerationService>,
    /// Unmetered image analysis.
    pub analysis: Arc<AnalysisService>,
    /// Webhooks and checkout sessions.
    pub payments: Arc<PaymentService>,
    /// Resolves bearer tokens to identities.
    pub identity: Arc<dyn IdentityProvider>,
    /// Authoritative pricing table.
    pub pricing: Arc<PricingTable>,
    /// Bearer token guarding the admin routes.
    pub admin_token: Option<SecretString>,
}

/// External collaborators the state is wired from.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Hosted auth provider.
    pub identity: Arc<dyn IdentityProvider>,
    /// Image-generation API.
    pub generator: Arc<dyn ImageGenerator>,
    /// Image-analysis API.
    pub analyzer: Arc<dyn ImageAnalyzer>,
    /// Payment processor.
    pub payments: Arc<dyn PaymentGateway>,
}

/// Wiring options that are not collaborators.
#[derive(Debug, Clone)]
pub struct StateOptions {
    /// Pricing table (its generation cost is the per-request cost).
    pub pricing: PricingTable,
    /// Model used when the client does not pick one.
    pub default_model: String,
    /// Models a client may pick.
    pub allowed_models: Vec<String>,
    /// Credits granted to new accounts.
    pub signup_bonus: i64,
    /// Webhook HMAC secret.
    pub webhook_secret: Option<SecretString>,
    /// Admin bearer token.
    pub admin_token: Option<SecretString>,
}

impl AppState {
    /// Builds the service graph on top of a ledger store and the external
    /// collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        collaborators: Collaborators,
        options: StateOptions,
    ) -> Self {
        let pricing = Arc::new(options.pricing);
        let ledger = Arc::new(LedgerService::new(store, options.signup_bonus));
        let analysis = Arc::new(AnalysisService::new(
            collaborators.analyzer,
            options.default_model.clone(),
        ));
        let generation = Arc::new(GenerationService::new(
            Arc::clone(&ledger),
            collaborators.generator,
            GenerationPolicy {
                cost: pricing.generation_cost,
                default_model: options.default_model,
                allowed_models: options.allowed_models,
            },
        ));
        let payments = Arc::new(PaymentService::new(
            Arc::clone(&ledger),
            collaborators.payments,
            Arc::clone(&pricing),
            options.webhook_secret,
        ));
        Self {
            ledger,
            generation,
            analysis,
            payments,
            identity: collaborators.identity,
            pricing,
            admin_token: options.admin_token,
        }
    }
}
