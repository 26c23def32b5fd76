//! Service layer: business logic orchestration.
//!
//! [`LedgerService`] owns the entitlement gate and the debit/credit
//! operators, [`GenerationService`] drives metered generation requests
//! through it, and [`PaymentService`] turns processor notifications into
//! idempotent credits. [`AnalysisService`] answers questions about images
//! without touching the ledger.

pub mod analysis_service;
pub mod generation_service;
pub mod ledger_service;
pub mod payment_service;

pub use analysis_service::AnalysisService;
pub use generation_service::{GenerationOutcome, GenerationService};
pub use ledger_service::{Entitlement, LedgerService, ReconcileReport};
pub use payment_service::{PaymentService, WebhookOutcome, WebhookPayload};
